//! Temporal subspace projection (tSSS).
//!
//! Temporal bases of the internal reconstruction and of the residual are
//! compared through their principal angles; directions whose correlation
//! reaches the threshold are treated as interference and projected out of
//! the data along the time axis.

use nalgebra::DMatrix;

use crate::error::{MaxwellError, Result};
use crate::types::{select_columns, thin_svd};

/// Orthonormal basis of the column space, rank decided like `scipy.linalg.orth`.
pub fn orth(a: DMatrix<f64>) -> Result<DMatrix<f64>> {
    let (m, n) = a.shape();
    if m == 0 || n == 0 {
        return Ok(DMatrix::zeros(m, 0));
    }
    let (u, s, _) = thin_svd(a)?;
    let tol = m.max(n) as f64 * s.max() * f64::EPSILON;
    let keep: Vec<usize> = (0..s.len()).filter(|&k| s[k] > tol).collect();
    Ok(select_columns(&u, &keep))
}

/// Orthonormal temporal basis (time x rank) of `data` (channels x time).
fn temporal_basis(data: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let norm = data.norm();
    if norm == 0.0 {
        return Ok(DMatrix::zeros(data.ncols(), 0));
    }
    let basis = orth(data.transpose() / norm)?;
    if basis.ncols() == 0 {
        return Ok(basis);
    }
    Ok(basis.qr().q())
}

/// Temporal projector (time x components) onto the intersection of the
/// internal and residual subspaces at correlation `corr`.
pub fn overlap_projector(data_int: &DMatrix<f64>, data_res: &DMatrix<f64>, corr: f64) -> Result<DMatrix<f64>> {
    let n_times = data_int.ncols();
    let q_int = temporal_basis(data_int)?;
    let q_res = temporal_basis(data_res)?;
    if q_int.ncols() == 0 || q_res.ncols() == 0 {
        return Ok(DMatrix::zeros(n_times, 0));
    }
    let c_mat = q_int.transpose() * &q_res;
    let (_, s_intersect, vh_intersect) = thin_svd(c_mat)?;
    let keep: Vec<usize> = (0..s_intersect.len())
        .filter(|&k| s_intersect[k] >= corr)
        .collect();
    let vh = DMatrix::from_fn(q_res.ncols(), keep.len(), |r, c| vh_intersect[(keep[c], r)]);
    Ok(q_res * vh)
}

/// `data - data P P^T`
pub fn apply_projector(data: &DMatrix<f64>, proj: &DMatrix<f64>) -> DMatrix<f64> {
    if proj.ncols() == 0 {
        return data.clone();
    }
    data - (data * proj) * proj.transpose()
}

/// Project the shared internal/residual components out of `data`.
///
/// Returns the projected data and the number of removed components.
pub fn do_tsss(
    data: &DMatrix<f64>,
    orig_in: &DMatrix<f64>,
    resid: &DMatrix<f64>,
    corr: f64,
    n_positions: usize,
    t_str: &str,
) -> Result<(DMatrix<f64>, usize)> {
    if resid.iter().any(|v| !v.is_finite()) {
        return Err(MaxwellError::Numerical(
            "tSSS residual contains non-finite values".to_string(),
        ));
    }
    let proj = overlap_projector(orig_in, resid, corr)?;
    let n_proj = proj.ncols();
    if n_positions > 1 {
        log::info!(
            "        Projecting {n_proj:2} intersecting tSSS components for {t_str} (across {n_positions:2} positions)"
        );
    } else {
        log::info!("        Projecting {n_proj:2} intersecting tSSS components for {t_str}");
    }
    Ok((apply_projector(data, &proj), n_proj))
}
