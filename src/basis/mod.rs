//! Multipolar moment (SSS) basis.
//!
//! Columns are ordered by `(degree, order)` with the internal moments first
//! and the external moments after them; rows follow the coil order of the
//! [`IntegrationPointSet`]. Degree 0 is never part of the expansion.

pub mod complex;

use std::f64::consts::{PI, SQRT_2};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::geometry::IntegrationPointSet;
use crate::types::{Transform, Vec3};

/// Vacuum permeability [T m / A]
pub const MU_0: f64 = 4e-7 * PI;

/// Expansion origin and orders.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expansion {
    pub origin: Vec3,
    pub int_order: usize,
    pub ext_order: usize,
}

impl Expansion {
    pub fn new(origin: Vec3, int_order: usize, ext_order: usize) -> Self {
        Self {
            origin,
            int_order,
            ext_order,
        }
    }

    pub fn n_in(&self) -> usize {
        n_moments(self.int_order)
    }

    pub fn n_out(&self) -> usize {
        n_moments(self.ext_order)
    }

    pub fn n_total(&self) -> usize {
        self.n_in() + self.n_out()
    }

    /// Same origin and internal order, no external terms
    pub fn internal_only(&self) -> Self {
        Self {
            ext_order: 0,
            ..self.clone()
        }
    }
}

/// Number of moments for an expansion truncated at `order` (degrees 1..=order).
pub fn n_moments(order: usize) -> usize {
    order * (order + 2)
}

/// Column index of `(degree, order)` within one (internal or external) block.
pub fn deg_ord_idx(degree: usize, order: i64) -> usize {
    let degree = degree as i64;
    (degree * degree + degree + order - 1) as usize
}

/// Degree and order of every column of a block truncated at `max_degree`.
pub fn degrees_orders(max_degree: usize) -> (Vec<usize>, Vec<i64>) {
    let n = n_moments(max_degree);
    let mut degrees = vec![0; n];
    let mut orders = vec![0; n];
    for degree in 1..=max_degree {
        for order in -(degree as i64)..=(degree as i64) {
            let idx = deg_ord_idx(degree, order);
            degrees[idx] = degree;
            orders[idx] = order;
        }
    }
    (degrees, orders)
}

/// Row scaling applied after the basis is assembled.
#[derive(Clone, Copy, Debug)]
pub enum CoilScale<'a> {
    /// Scale coils flagged in `mag_mask` by the magnetometer gain
    Magnetometers(f64),
    /// Explicit factor per coil
    PerCoil(&'a [f64]),
}

impl CoilScale<'_> {
    fn factor(&self, coils: &IntegrationPointSet, coil: usize) -> f64 {
        match self {
            CoilScale::Magnetometers(scale) => {
                if coils.mag_mask[coil] {
                    *scale
                } else {
                    1.0
                }
            }
            CoilScale::PerCoil(scales) => scales[coil],
        }
    }
}

/// Associated Legendre functions (Condon-Shortley phase) at `x`.
///
/// `table[degree][order]` for `order <= degree`; `table[degree][degree + 1]`
/// is zero so the polar recurrence can read one past the diagonal.
pub(crate) fn legendre_table(x: f64, max_degree: usize) -> Vec<Vec<f64>> {
    let mut table: Vec<Vec<f64>> = (0..=max_degree).map(|d| vec![0.0; d + 2]).collect();
    let sx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
    let mut pnn = 1.0;
    let mut fact = 1.0;
    for degree in 0..=max_degree {
        table[degree][degree] = pnn;
        pnn *= -fact * sx2;
        fact += 2.0;
        if degree < max_degree {
            table[degree + 1][degree] = x * (2 * degree + 1) as f64 * table[degree][degree];
        }
        if degree >= 2 {
            for order in 0..degree - 1 {
                table[degree][order] = (x * (2 * degree - 1) as f64 * table[degree - 1][order]
                    - (degree + order - 1) as f64 * table[degree - 2][order])
                    / (degree - order) as f64;
            }
        }
    }
    table
}

/// `mu_0 * sqrt((2l + 1) / 4pi * (l - m)! / (l + m)!)`, times sqrt(2) for `m > 0`.
fn normalization_table(max_degree: usize) -> Vec<Vec<f64>> {
    (0..=max_degree)
        .map(|degree| {
            let mut mult = 2e-7 * ((2 * degree + 1) as f64 * PI).sqrt();
            let mut row = Vec::with_capacity(degree + 1);
            row.push(mult);
            for order in 1..=degree {
                mult /= (((degree - order + 1) * (degree + order)) as f64).sqrt();
                row.push(mult * SQRT_2);
            }
            row
        })
        .collect()
}

/// Spherical field components of one integration point, rotated to cartesian
/// and projected on the weighted normal.
struct PointFrame {
    cos_az: f64,
    sin_az: f64,
    cos_pol: f64,
    sin_pol: f64,
    normal: Vec3,
}

impl PointFrame {
    #[inline]
    fn project(&self, b_r: f64, b_az: f64, b_pol: f64) -> f64 {
        let x = self.sin_pol * self.cos_az * b_r + self.cos_pol * self.cos_az * b_pol
            - self.sin_az * b_az;
        let y = self.sin_pol * self.sin_az * b_r + self.cos_pol * self.sin_az * b_pol
            + self.cos_az * b_az;
        let z = self.cos_pol * b_r - self.sin_pol * b_pol;
        x * self.normal[0] + y * self.normal[1] + z * self.normal[2]
    }
}

/// Real-valued SSS basis for the coils (production path).
///
/// Does not apply any magnetometer scaling or column normalization.
pub fn sss_basis(exp: &Expansion, coils: &IntegrationPointSet) -> DMatrix<f64> {
    let (int_order, ext_order) = (exp.int_order, exp.ext_order);
    let n_in = exp.n_in();
    let mut s_tot = DMatrix::<f64>::zeros(coils.n_coils, exp.n_total());
    let max_order = int_order.max(ext_order);
    let norms = normalization_table(max_order);

    for ((rmag, cosmag), &bin) in coils.rmags.iter().zip(&coils.cosmags).zip(&coils.bins) {
        let r = rmag - exp.origin;
        let r_n = r.norm();
        let mut r_xy = (r[0] * r[0] + r[1] * r[1]).sqrt();
        let cos_pol = r[2] / r_n;
        let sin_pol = (1.0 - cos_pol * cos_pol).max(0.0).sqrt();
        let z_only = r_xy <= 1e-16;
        if z_only {
            r_xy = 1.0;
        }
        let (cos_az, sin_az) = if z_only {
            (1.0, 0.0)
        } else {
            (r[0] / r_xy, r[1] / r_xy)
        };
        let phi = r[1].atan2(r[0]);
        let frame = PointFrame {
            cos_az,
            sin_az,
            cos_pol,
            sin_pol,
            normal: *cosmag,
        };
        let legendre = legendre_table(cos_pol, max_order);
        let az_div = |value: f64, radial: f64| {
            if z_only {
                0.0
            } else {
                value / (sin_pol * radial)
            }
        };

        // r^(l+2) for internal, r^(l-1) for external terms
        let mut r_nn2 = r_n;
        let mut r_nn1 = 1.0 / (r_n * r_n);
        for degree in 0..=max_order {
            if degree <= ext_order {
                r_nn1 *= r_n;
            }
            if degree <= int_order {
                r_nn2 *= r_n;
            }
            if degree == 0 {
                continue;
            }
            let l = degree as f64;
            let lp = &legendre[degree];

            // alpha (internal) and beta (external) for order 0
            let mult = norms[degree][0];
            let idx = deg_ord_idx(degree, 0);
            if degree <= int_order {
                let b_r = mult * (l + 1.0) * lp[0] / r_nn2;
                let b_pol = -mult * lp[1] / r_nn2;
                s_tot[(bin, idx)] += frame.project(b_r, 0.0, b_pol);
            }
            if degree <= ext_order {
                let b_r = -mult * l * lp[0] * r_nn1;
                let b_pol = -mult * lp[1] * r_nn1;
                s_tot[(bin, n_in + idx)] += frame.project(b_r, 0.0, b_pol);
            }

            for order in 1..=degree {
                let m = order as f64;
                let factor = norms[degree][order];
                let (sin_order, cos_order) = (m * phi).sin_cos();
                let pol_diff =
                    lp[order + 1] - (l + m) * (l - m + 1.0) * lp[order - 1];

                // Real
                let idx = deg_ord_idx(degree, order as i64);
                let r_fact = factor * lp[order] * cos_order;
                let az_fact = factor * m * sin_order * lp[order];
                let pol_fact = -factor * pol_diff * cos_order;
                if degree <= int_order {
                    let b_r = (l + 1.0) * r_fact / r_nn2;
                    let b_az = az_div(az_fact, r_nn2);
                    let b_pol = pol_fact / (2.0 * r_nn2);
                    s_tot[(bin, idx)] += frame.project(b_r, b_az, b_pol);
                }
                if degree <= ext_order {
                    let b_r = -l * r_fact * r_nn1;
                    let b_az = az_div(az_fact * r_nn1, 1.0);
                    let b_pol = pol_fact * r_nn1 / 2.0;
                    s_tot[(bin, n_in + idx)] += frame.project(b_r, b_az, b_pol);
                }

                // Imaginary
                let idx = deg_ord_idx(degree, -(order as i64));
                let r_fact = factor * lp[order] * sin_order;
                let az_fact = factor * m * cos_order * lp[order];
                let pol_fact = factor * pol_diff * sin_order;
                if degree <= int_order {
                    let b_r = -(l + 1.0) * r_fact / r_nn2;
                    let b_az = az_div(az_fact, r_nn2);
                    let b_pol = pol_fact / (2.0 * r_nn2);
                    s_tot[(bin, idx)] += frame.project(b_r, b_az, b_pol);
                }
                if degree <= ext_order {
                    let b_r = l * r_fact * r_nn1;
                    let b_az = az_div(az_fact * r_nn1, 1.0);
                    let b_pol = pol_fact * r_nn1 / 2.0;
                    s_tot[(bin, n_in + idx)] += frame.project(b_r, b_az, b_pol);
                }
            }
        }
    }
    s_tot
}

/// SSS basis evaluated after moving the coils with `trans`, then row-scaled.
pub fn trans_sss_basis(
    exp: &Expansion,
    coils: &IntegrationPointSet,
    trans: Option<&Transform>,
    coil_scale: CoilScale<'_>,
) -> DMatrix<f64> {
    let mut s_tot = match trans {
        Some(trans) => {
            debug_assert!(trans.is_finite());
            sss_basis(exp, &coils.transformed(trans))
        }
        None => sss_basis(exp, coils),
    };
    for (coil, mut row) in s_tot.row_iter_mut().enumerate() {
        row *= coil_scale.factor(coils, coil);
    }
    s_tot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::prep_mf_coils;
    use crate::test_utils::{synthetic_info, uniform_field_response};
    use crate::types::CoordFrame;
    use approx::assert_relative_eq;

    #[test]
    fn test_moment_counts() {
        assert_eq!(n_moments(8), 80);
        assert_eq!(n_moments(3), 15);
        assert_eq!(n_moments(0), 0);
        let exp = Expansion::new(Vec3::zeros(), 8, 3);
        assert_eq!(exp.n_total(), 95);
        assert_eq!(exp.internal_only().n_total(), 80);
    }

    #[test]
    fn test_deg_ord_idx_covers_block() {
        let (degrees, orders) = degrees_orders(4);
        assert_eq!(deg_ord_idx(1, -1), 0);
        assert_eq!(deg_ord_idx(1, 1), 2);
        assert_eq!(deg_ord_idx(4, 4), 23);
        for (idx, (&d, &o)) in degrees.iter().zip(&orders).enumerate() {
            assert_eq!(deg_ord_idx(d, o), idx);
        }
    }

    #[test]
    fn test_legendre_known_values() {
        let x = 0.3_f64;
        let table = legendre_table(x, 3);
        let s = (1.0 - x * x).sqrt();
        assert_relative_eq!(table[1][0], x, epsilon = 1e-15);
        assert_relative_eq!(table[1][1], -s, epsilon = 1e-15);
        assert_relative_eq!(table[2][0], 0.5 * (3.0 * x * x - 1.0), epsilon = 1e-15);
        assert_relative_eq!(table[2][1], -3.0 * x * s, epsilon = 1e-15);
        assert_relative_eq!(table[2][2], 3.0 * s * s, epsilon = 1e-15);
        assert_relative_eq!(table[3][0], 0.5 * (5.0 * x.powi(3) - 3.0 * x), epsilon = 1e-15);
        assert_eq!(table[3][4], 0.0);
    }

    #[test]
    fn test_basis_shape_and_determinism() {
        let info = synthetic_info(20, None);
        let coils = prep_mf_coils(&info, false).unwrap();
        let exp = Expansion::new(Vec3::zeros(), 4, 2);
        let a = sss_basis(&exp, &coils);
        let b = sss_basis(&exp, &coils);
        assert_eq!(a.shape(), (60, 32));
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_external_dipole_terms_span_uniform_field() {
        let info = synthetic_info(30, None);
        let coils = prep_mf_coils(&info, false).unwrap();
        let exp = Expansion::new(Vec3::new(0.0, 0.0, 0.01), 1, 1);
        let s = sss_basis(&exp, &coils);
        let s_out = s.columns(3, 3).into_owned();
        let field = uniform_field_response(&coils, &Vec3::new(1e-9, -2e-9, 0.5e-9));
        let fit = s_out
            .clone()
            .svd(true, true)
            .solve(&field, 1e-14)
            .unwrap();
        let resid = &field - &s_out * fit;
        assert!(resid.norm() < 1e-9 * field.norm());
    }

    #[test]
    fn test_trans_basis_matches_moved_origin() {
        // Moving the coils by t is the same as moving the origin by -t.
        let info = synthetic_info(10, None);
        let coils = prep_mf_coils(&info, false).unwrap();
        let shift = Vec3::new(0.002, -0.001, 0.004);
        let trans = Transform::from_rotation_translation(
            CoordFrame::Meg,
            CoordFrame::Head,
            &crate::types::Mat3::identity(),
            &shift,
        );
        let exp = Expansion::new(Vec3::new(0.0, 0.0, 0.04), 3, 2);
        let moved = trans_sss_basis(&exp, &coils, Some(&trans), CoilScale::Magnetometers(1.0));
        let exp_shifted = Expansion::new(exp.origin - shift, 3, 2);
        let direct = sss_basis(&exp_shifted, &coils);
        let tol = direct.amax() * 1e-10;
        assert_relative_eq!(moved, direct, max_relative = 1e-10, epsilon = tol);
    }

    #[test]
    fn test_magnetometer_rows_scaled() {
        let info = synthetic_info(5, None);
        let coils = prep_mf_coils(&info, false).unwrap();
        let exp = Expansion::new(Vec3::zeros(), 2, 1);
        let raw = sss_basis(&exp, &coils);
        let scaled = trans_sss_basis(&exp, &coils, None, CoilScale::Magnetometers(100.0));
        for coil in 0..coils.n_coils {
            let factor = if coils.mag_mask[coil] { 100.0 } else { 1.0 };
            assert_relative_eq!(
                scaled.row(coil).into_owned(),
                raw.row(coil) * factor,
                max_relative = 1e-14
            );
        }
    }
}
