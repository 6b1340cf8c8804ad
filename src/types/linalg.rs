//! Linear algebra type system for the Maxwell filter
//!
//! Fixed-size aliases for geometry and conversions between the ndarray
//! sample storage and the nalgebra matrices used for decompositions.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix4, Vector3};
use ndarray::{Array2, ArrayView2};

use crate::error::{MaxwellError, Result};

// ===== Geometry Types =====
pub type Vec3 = Vector3<f64>;
pub type Mat3 = Matrix3<f64>;
pub type Mat4 = Matrix4<f64>;

// ===== Coil location layout =====
pub const LOC_LEN: usize = 12; // position, ex, ey, ez

/// Copy a (possibly non-contiguous) ndarray view into a dense nalgebra matrix.
pub fn dmatrix_from_view(view: ArrayView2<'_, f64>) -> DMatrix<f64> {
    let (rows, cols) = view.dim();
    DMatrix::from_fn(rows, cols, |r, c| view[[r, c]])
}

/// Copy a dense nalgebra matrix back into ndarray storage.
pub fn array_from_dmatrix(matrix: &DMatrix<f64>) -> Array2<f64> {
    let (rows, cols) = matrix.shape();
    Array2::from_shape_fn((rows, cols), |(r, c)| matrix[(r, c)])
}

/// Select a subset of rows, in the given order.
pub fn select_rows(matrix: &DMatrix<f64>, rows: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), matrix.ncols(), |r, c| matrix[(rows[r], c)])
}

/// Select a subset of columns, in the given order.
pub fn select_columns(matrix: &DMatrix<f64>, cols: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(matrix.nrows(), cols.len(), |r, c| matrix[(r, cols[c])])
}

/// Euclidean norm of every column.
pub fn column_norms(matrix: &DMatrix<f64>) -> Vec<f64> {
    matrix.column_iter().map(|col| col.norm()).collect()
}

/// Economy SVD `(U, s, Vt)` with singular values in descending order.
pub fn thin_svd(matrix: DMatrix<f64>) -> Result<(DMatrix<f64>, DVector<f64>, DMatrix<f64>)> {
    let svd = matrix.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(MaxwellError::Numerical(
            "SVD did not return singular vectors".to_string(),
        ));
    };
    Ok((u, svd.singular_values, v_t))
}

/// Ratio of the largest to the smallest singular value.
pub fn condition_number(singular_values: &DVector<f64>) -> f64 {
    singular_values.max() / singular_values.min()
}
