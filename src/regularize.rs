//! Basis regularization.
//!
//! External moments are trimmed by a fixed norm rule; internal moments by an
//! information criterion: components are removed one by one (worst estimated
//! SNR first) and the subset that keeps at least 98% of the peak information
//! `0.5 * sum(log2(1 + snr))` is retained.

use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::basis::{degrees_orders, n_moments, Expansion};
use crate::error::{MaxwellError, Result};
use crate::types::{column_norms, select_columns, thin_svd};

// ===== Regularization constants =====
/// Sensor noise level [T/m]
pub const NOISE_LEVEL: f64 = 5e-13;
/// Fraction of the peak information the retained internal set must reach
pub const INFO_FRACTION: f64 = 0.98;
/// Current density of the randomly activated sphere
const RHO_I: f64 = 5.911_073_756_32e-7;
/// Radius of the randomly activated sphere [m]
const R_IN: f64 = 0.080;
/// Normalization corrections matching the reference noise model
const ZERO_ORDER_CORRECTION: f64 = 2.0;
const NOISE_CORRECTION: f64 = 0.0025;

/// Regularization mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regularize {
    /// Information-based removal of internal components
    #[default]
    In,
    None,
}

impl FromStr for Regularize {
    type Err = MaxwellError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in" => Ok(Regularize::In),
            "none" => Ok(Regularize::None),
            other => Err(MaxwellError::UnsupportedMode(format!(
                "regularize must be \"in\" or \"none\", got \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for Regularize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Regularize::In => "in",
            Regularize::None => "none",
        })
    }
}

/// Early exit for the SNR removal sweep.
///
/// Once more than `min_iterations` components have been removed, the sweep
/// stops when the last two information values are both below
/// `plateau_fraction` of the running peak. Only the amount of work changes:
/// the retained set is still chosen with [`INFO_FRACTION`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoppingRule {
    pub min_iterations: usize,
    pub plateau_fraction: f64,
}

impl Default for StoppingRule {
    fn default() -> Self {
        Self {
            min_iterations: 10,
            plateau_fraction: 0.95,
        }
    }
}

impl StoppingRule {
    /// `info[..=iteration]` holds the information of every step so far.
    pub fn should_stop(&self, iteration: usize, info: &[f64]) -> bool {
        if iteration <= self.min_iterations {
            return false;
        }
        let peak = info.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let limit = self.plateau_fraction * peak;
        info[iteration - 1] < limit && info[iteration] < limit
    }
}

/// Pseudoinverse of a column-normalized matrix with the scaling undone.
#[derive(Clone, Debug)]
pub struct NormalizedPinv {
    pub pinv: DMatrix<f64>,
    pub singular_values: DVector<f64>,
}

impl NormalizedPinv {
    pub fn condition(&self) -> f64 {
        crate::types::condition_number(&self.singular_values)
    }
}

/// Normalize columns, pseudo-invert through the SVD and undo the normalization.
pub fn col_norm_pinv(x: &DMatrix<f64>) -> Result<NormalizedPinv> {
    let norms = column_norms(x);
    let mut normalized = x.clone();
    for (mut col, norm) in normalized.column_iter_mut().zip(&norms) {
        col /= *norm;
    }
    let (u, s, v_t) = thin_svd(normalized)?;
    let mut v = v_t.transpose();
    for (mut row, norm) in v.row_iter_mut().zip(&norms) {
        row /= *norm;
    }
    for (mut col, sv) in v.column_iter_mut().zip(s.iter()) {
        col /= *sv;
    }
    Ok(NormalizedPinv {
        pinv: v * u.transpose(),
        singular_values: s,
    })
}

/// Power `a_lm^2` produced by random currents in a sphere, per degree `0..=int_order`.
pub fn compute_sphere_activation_in(int_order: usize) -> Vec<f64> {
    (0..=int_order)
        .map(|degree| {
            let l = degree as f64;
            RHO_I * RHO_I * (l * R_IN.powi(2 * degree as i32 + 4)
                / ((2.0 * l + 1.0).powi(2) * (l + 1.0)))
        })
        .collect()
}

/// External degree-1 moments are dropped unless a sensor resolves them.
pub fn regularize_out(int_order: usize, ext_order: usize, mag_or_fine: &[bool]) -> Vec<usize> {
    let n_in = n_moments(int_order);
    let n_drop = if mag_or_fine.iter().any(|&f| f) { 0 } else { 3 };
    (n_in..n_in + n_drop.min(n_moments(ext_order))).collect()
}

/// Internal and external moments to remove.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Removals {
    pub in_removes: Vec<usize>,
    pub out_removes: Vec<usize>,
}

/// Information-based selection of internal moments.
pub fn regularize_in(
    exp: &Expansion,
    s_decomp: &DMatrix<f64>,
    mag_or_fine: &[bool],
    rule: &StoppingRule,
) -> Result<Removals> {
    let (n_in, n_out) = (exp.n_in(), exp.n_out());
    let a_lm_sq = compute_sphere_activation_in(exp.int_order);
    let (degrees, orders) = degrees_orders(exp.int_order);
    let noise_lev = NOISE_LEVEL * NOISE_LEVEL;

    let out_removes = regularize_out(exp.int_order, exp.ext_order, mag_or_fine);
    let out_keepers: Vec<usize> = (n_in..n_in + n_out)
        .filter(|idx| !out_removes.contains(idx))
        .collect();
    if n_in == 0 {
        return Ok(Removals {
            in_removes: Vec::new(),
            out_removes,
        });
    }
    let mut in_keepers: Vec<usize> = (0..n_in).collect();

    let use_norm = column_norms(s_decomp);
    let mut normalized = s_decomp.clone();
    for (mut col, norm) in normalized.column_iter_mut().zip(&use_norm) {
        col /= *norm;
    }

    let mut info = vec![0.0; n_in];
    let mut remove_order = Vec::with_capacity(n_in);
    let mut extremes = Vec::with_capacity(n_in);
    for ii in 0..n_in {
        let cols: Vec<usize> = in_keepers.iter().chain(&out_keepers).copied().collect();
        let (u, s, v_t) = thin_svd(select_columns(&normalized, &cols))?;
        extremes.push((s.max(), s.min()));

        // rows of the pseudoinverse belonging to internal moments
        let mut v = v_t.transpose().rows(0, in_keepers.len()).into_owned();
        for (mut row, &moment) in v.row_iter_mut().zip(&in_keepers) {
            row /= use_norm[moment];
        }
        for (mut col, sv) in v.column_iter_mut().zip(s.iter()) {
            col /= *sv;
        }
        let eta = v * u.transpose();

        let snr: Vec<f64> = in_keepers
            .iter()
            .enumerate()
            .map(|(row, &moment)| {
                let mut eta_lm_sq = eta.row(row).norm_squared() * noise_lev;
                if orders[moment] == 0 {
                    eta_lm_sq *= ZERO_ORDER_CORRECTION;
                }
                eta_lm_sq *= NOISE_CORRECTION;
                a_lm_sq[degrees[moment]] / eta_lm_sq
            })
            .collect();
        info[ii] = 0.5 * snr.iter().map(|v| (v + 1.0).log2()).sum::<f64>();

        let worst = snr
            .iter()
            .enumerate()
            .fold(0, |best, (idx, v)| if *v < snr[best] { idx } else { best });
        remove_order.push(in_keepers.remove(worst));
        if rule.should_stop(ii, &info) {
            break;
        }
    }

    let max_info = info.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let lim_idx = info
        .iter()
        .position(|&v| v >= INFO_FRACTION * max_info)
        .unwrap_or(0);
    let in_removes = remove_order[..lim_idx].to_vec();
    for (ii, &ri) in in_removes.iter().enumerate() {
        let (hi, lo) = extremes[ii];
        log::debug!(
            "            Condition {:.3}/{:.3} = {:.1}, Removing in component {}: l={}, m={:+}",
            hi,
            lo,
            hi / lo,
            ri,
            degrees[ri],
            orders[ri]
        );
    }
    log::debug!(
        "        Resulting information: {:.1} bits/sample ({:.1}% of peak {:.1})",
        info[lim_idx],
        100.0 * info[lim_idx] / max_info,
        max_info
    );
    Ok(Removals {
        in_removes,
        out_removes,
    })
}

/// Regularized basis with its pseudoinverse.
#[derive(Clone, Debug)]
pub struct RegularizedBasis {
    /// Retained columns of the input basis
    pub basis: DMatrix<f64>,
    pub pinv: DMatrix<f64>,
    pub singular_values: DVector<f64>,
    /// Retained moment indices, internal first, ascending
    pub reg_moments: Vec<usize>,
    pub n_use_in: usize,
}

impl RegularizedBasis {
    pub fn condition(&self) -> f64 {
        crate::types::condition_number(&self.singular_values)
    }
}

/// Select the moments to keep and pseudo-invert the reduced basis.
///
/// `t` is only used for log messages.
pub fn regularize(
    mode: Regularize,
    exp: &Expansion,
    s_decomp: &DMatrix<f64>,
    mag_or_fine: &[bool],
    rule: &StoppingRule,
    t: f64,
) -> Result<RegularizedBasis> {
    let (n_in, n_out) = (exp.n_in(), exp.n_out());
    let removals = match mode {
        Regularize::In => {
            log::info!("    Computing regularization");
            regularize_in(exp, s_decomp, mag_or_fine, rule)?
        }
        Regularize::None => Removals {
            in_removes: Vec::new(),
            out_removes: regularize_out(exp.int_order, exp.ext_order, mag_or_fine),
        },
    };
    let reg_in: Vec<usize> = (0..n_in)
        .filter(|idx| !removals.in_removes.contains(idx))
        .collect();
    let reg_out: Vec<usize> = (n_in..n_in + n_out)
        .filter(|idx| !removals.out_removes.contains(idx))
        .collect();
    let (n_use_in, n_use_out) = (reg_in.len(), reg_out.len());
    let reg_moments: Vec<usize> = reg_in.into_iter().chain(reg_out).collect();

    let basis = select_columns(s_decomp, &reg_moments);
    let NormalizedPinv {
        pinv,
        singular_values,
    } = col_norm_pinv(&basis)?;
    if mode == Regularize::In || n_use_out != n_out {
        log::info!(
            "        Using {}/{} harmonic components for {:8.3}  ({}/{} in, {}/{} out)",
            n_use_in + n_use_out,
            n_in + n_out,
            t,
            n_use_in,
            n_in,
            n_use_out,
            n_out
        );
    }
    Ok(RegularizedBasis {
        basis,
        pinv,
        singular_values,
        reg_moments,
        n_use_in,
    })
}
