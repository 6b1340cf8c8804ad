//! Complex spherical-harmonic route to the SSS basis.
//!
//! Slower than [`super::sss_basis`]; it evaluates the textbook complex
//! harmonics and converts to the real basis at the end, which makes it a
//! useful independent check of the production path.

use nalgebra::{Complex, DMatrix};

use super::{deg_ord_idx, legendre_table, n_moments, Expansion, MU_0};
use crate::geometry::IntegrationPointSet;

pub type Complex64 = Complex<f64>;

/// Sign applied to negative-order columns when going complex -> real,
/// indexed by order parity (even, odd).
///
/// Pinned: it is what makes `bases_complex_to_real(bases_real_to_complex(x)) == x`
/// and matches the reference basis; it is not derived from first principles here.
pub const NEGATIVE_ORDER_SIGN: [f64; 2] = [-1.0, 1.0];

/// Normalization of the complex spherical harmonic `Y_l^m`.
pub fn sph_harm_norm(order: usize, degree: usize) -> f64 {
    let mut norm = ((2 * degree + 1) as f64 / (4.0 * std::f64::consts::PI)).sqrt();
    if order != 0 {
        // (l - m)! / (l + m)! without overflowing factorials
        let ratio: f64 = ((degree - order + 1)..=(degree + order))
            .map(|k| 1.0 / k as f64)
            .product();
        norm *= ratio.sqrt();
    }
    norm
}

/// `Y_l^m(az, pol)` with the Condon-Shortley phase.
pub fn sph_harm(order: usize, degree: usize, az: f64, pol: f64) -> Complex64 {
    let table = legendre_table(pol.cos(), degree);
    Complex64::from_polar(sph_harm_norm(order, degree) * table[degree][order], order as f64 * az)
}

/// `P_l^{m-1}`, extended to `m = 0` through `P_l^{-1} = -P_l^1 / (l (l + 1))`.
fn legendre_lower(table: &[Vec<f64>], order: usize, degree: usize) -> f64 {
    if order == 0 {
        -table[degree][1] / (degree * (degree + 1)) as f64
    } else {
        table[degree][order - 1]
    }
}

/// Derivative of the associated Legendre function with respect to its argument.
pub fn alegendre_deriv(order: usize, degree: usize, val: f64) -> f64 {
    let table = legendre_table(val, degree);
    alegendre_deriv_from(&table, order, degree, val)
}

fn alegendre_deriv_from(table: &[Vec<f64>], order: usize, degree: usize, val: f64) -> f64 {
    let (m, l) = (order as f64, degree as f64);
    let one_minus = 1.0 - val * val;
    (m * val * table[degree][order]
        + (l + m) * (l - m + 1.0) * one_minus.sqrt() * legendre_lower(table, order, degree))
        / one_minus
}

/// `conj(Y) * (-1)^m`, i.e. the harmonic of order `-m`.
pub fn sh_negate(value: Complex64, order: usize) -> Complex64 {
    let sign = if order % 2 == 1 { -1.0 } else { 1.0 };
    value.conj() * sign
}

pub fn sh_complex_to_real(value: Complex64, order: i64) -> f64 {
    match order {
        0 => value.re,
        o if o > 0 => std::f64::consts::SQRT_2 * value.re,
        _ => std::f64::consts::SQRT_2 * value.im,
    }
}

pub fn sh_real_to_complex(pos: f64, neg: f64, order: i64) -> Complex64 {
    if order == 0 {
        Complex64::new(pos, 0.0)
    } else {
        Complex64::new(pos, order.signum() as f64 * neg) / std::f64::consts::SQRT_2
    }
}

/// Complex SSS basis; magnetometer rows scaled by `mag_scale`.
///
/// Columns hold the gradients of `conj(Y_l^m)`, the convention of
/// [`bases_real_to_complex`], so [`bases_complex_to_real`] recovers
/// [`super::sss_basis`] column for column.
pub fn sss_basis_complex(
    exp: &Expansion,
    coils: &IntegrationPointSet,
    mag_scale: f64,
) -> DMatrix<Complex64> {
    let (int_order, ext_order) = (exp.int_order, exp.ext_order);
    let n_in = exp.n_in();
    let max_order = int_order.max(ext_order);
    let mut s_tot = DMatrix::<Complex64>::zeros(coils.n_coils, exp.n_total());

    for ((rmag, cosmag), &bin) in coils.rmags.iter().zip(&coils.cosmags).zip(&coils.bins) {
        let r = rmag - exp.origin;
        let rad = r.norm();
        let az = r[1].atan2(r[0]);
        let pol = (r[2] / rad).clamp(-1.0, 1.0).acos();
        let (sin_pol, cos_pol) = pol.sin_cos();
        let (sin_az, cos_az) = az.sin_cos();
        let table = legendre_table(cos_pol, max_order);

        // radial, polar and azimuthal unit vectors dotted with the normal
        let n_rad = cos_az * sin_pol * cosmag[0] + sin_az * sin_pol * cosmag[1] + cos_pol * cosmag[2];
        let n_pol = cos_az * cos_pol * cosmag[0] + sin_az * cos_pol * cosmag[1] - sin_pol * cosmag[2];
        let n_az = -sin_az * cosmag[0] + cos_az * cosmag[1];

        for degree in 1..=max_order {
            let l = degree as f64;
            for order in 0..=degree {
                let norm = sph_harm_norm(order, degree);
                let phase = Complex64::from_polar(1.0, order as f64 * az);
                let sph = phase * (norm * table[degree][order]);
                let az_factor = Complex64::new(0.0, order as f64) * sph / pol.max(1e-16).sin();
                let pol_factor =
                    phase * (-norm * sin_pol * alegendre_deriv_from(&table, order, degree, cos_pol));

                let mut blocks = Vec::with_capacity(2);
                if degree <= int_order {
                    let in_norm = MU_0 * rad.powi(-(degree as i32 + 2));
                    blocks.push((0, in_norm * -(l + 1.0), in_norm));
                }
                if degree <= ext_order {
                    let out_norm = MU_0 * rad.powi(degree as i32 - 1);
                    blocks.push((n_in, out_norm * l, out_norm));
                }
                for (offset, rad_mult, ang_mult) in blocks {
                    let g_rad = sph * rad_mult;
                    let g_az = az_factor * ang_mult;
                    let g_pol = pol_factor * ang_mult;
                    let v = (g_rad * n_rad + g_pol * n_pol + g_az * n_az).conj();
                    s_tot[(bin, offset + deg_ord_idx(degree, order as i64))] -= v;
                    if order > 0 {
                        s_tot[(bin, offset + deg_ord_idx(degree, -(order as i64)))] -=
                            sh_negate(v, order);
                    }
                }
            }
        }
    }

    for (coil, mut row) in s_tot.row_iter_mut().enumerate() {
        if coils.mag_mask[coil] {
            row *= Complex64::new(mag_scale, 0.0);
        }
    }
    s_tot
}

fn block_ranges(int_order: usize, ext_order: usize) -> [(usize, usize); 2] {
    [(0, int_order), (n_moments(int_order), ext_order)]
}

/// Convert complex basis columns to their real counterparts.
pub fn bases_complex_to_real(
    complex_tot: &DMatrix<Complex64>,
    int_order: usize,
    ext_order: usize,
) -> DMatrix<f64> {
    let mut real_tot = DMatrix::<f64>::zeros(complex_tot.nrows(), complex_tot.ncols());
    for (offset, exp_order) in block_ranges(int_order, ext_order) {
        for degree in 1..=exp_order {
            for order in 0..=degree as i64 {
                let idx_pos = offset + deg_ord_idx(degree, order);
                let idx_neg = offset + deg_ord_idx(degree, -order);
                for row in 0..complex_tot.nrows() {
                    real_tot[(row, idx_pos)] =
                        sh_complex_to_real(complex_tot[(row, idx_pos)], order);
                    if order != 0 {
                        let sign = NEGATIVE_ORDER_SIGN[(order % 2) as usize];
                        real_tot[(row, idx_neg)] =
                            sign * sh_complex_to_real(complex_tot[(row, idx_neg)], -order);
                    }
                }
            }
        }
    }
    real_tot
}

/// Convert real basis columns to complex ones.
pub fn bases_real_to_complex(
    real_tot: &DMatrix<f64>,
    int_order: usize,
    ext_order: usize,
) -> DMatrix<Complex64> {
    let mut comp_tot = DMatrix::<Complex64>::zeros(real_tot.nrows(), real_tot.ncols());
    for (offset, exp_order) in block_ranges(int_order, ext_order) {
        for degree in 1..=exp_order {
            for order in 0..=degree as i64 {
                let idx_pos = offset + deg_ord_idx(degree, order);
                let idx_neg = offset + deg_ord_idx(degree, -order);
                for row in 0..real_tot.nrows() {
                    let value = sh_real_to_complex(
                        real_tot[(row, idx_pos)],
                        real_tot[(row, idx_neg)],
                        order,
                    );
                    comp_tot[(row, idx_pos)] = value;
                    comp_tot[(row, idx_neg)] = sh_negate(value, order as usize);
                }
            }
        }
    }
    comp_tot
}
