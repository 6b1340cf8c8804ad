//! Per-pose basis decomposition and its cache.
//!
//! A decomposition is the regularized SSS basis of the good channels at one
//! device -> head pose together with its pseudoinverse, both in physical
//! channel units. Consecutive buffers sharing a pose share a decomposition.

use std::rc::Rc;

use nalgebra::DMatrix;

use crate::basis::{trans_sss_basis, CoilScale, Expansion};
use crate::calibration::Calibration;
use crate::config::BadCondition;
use crate::error::Result;
use crate::geometry::IntegrationPointSet;
use crate::regularize::{regularize, Regularize, StoppingRule};
use crate::types::{select_rows, Transform};

#[derive(Clone, Debug)]
pub struct Decomposition {
    /// Retained basis columns, good channels only, unscaled rows
    pub basis: DMatrix<f64>,
    /// Pseudoinverse of `basis`
    pub pinv: DMatrix<f64>,
    /// Retained moment indices, internal first
    pub reg_moments: Vec<usize>,
    pub n_use_in: usize,
    pub condition: f64,
    pub trans: Option<Transform>,
}

impl Decomposition {
    /// Internal multipole moments of `data` (good channels x time).
    pub fn internal_moments(&self, data: &DMatrix<f64>) -> DMatrix<f64> {
        self.pinv.rows(0, self.n_use_in) * data
    }

    /// Internal part of `data` as seen by the good channels.
    pub fn internal_field(&self, data: &DMatrix<f64>) -> DMatrix<f64> {
        self.basis.columns(0, self.n_use_in) * self.internal_moments(data)
    }

    /// External part of `data` as seen by the good channels.
    pub fn external_field(&self, data: &DMatrix<f64>) -> DMatrix<f64> {
        let n_out = self.reg_moments.len() - self.n_use_in;
        self.basis.columns(self.n_use_in, n_out) * (self.pinv.rows(self.n_use_in, n_out) * data)
    }

    /// Internal/residual split used by the temporal projection.
    ///
    /// Returns `(internal, residual)` where the residual is whatever neither
    /// the internal nor the external expansion explains.
    pub fn split(&self, data: &DMatrix<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let internal = self.internal_field(data);
        let resid = data - self.external_field(data) - &internal;
        (internal, resid)
    }
}

/// Everything a decomposition depends on apart from the pose.
#[derive(Clone, Debug)]
pub struct DecompositionBuilder {
    pub exp: Expansion,
    /// Coils of every MEG channel used for filtering, device frame
    pub coils: IntegrationPointSet,
    pub calibration: Option<Calibration>,
    pub regularize: Regularize,
    pub stopping_rule: StoppingRule,
    pub bad_condition: BadCondition,
    pub mag_scale: f64,
    /// Per-coil gain (magnetometers get `mag_scale`)
    pub coil_scale: Vec<f64>,
    /// Rows of `coils` belonging to good channels
    pub good_rows: Vec<usize>,
    pub mag_or_fine: Vec<bool>,
}

impl DecompositionBuilder {
    /// Decompose the basis at `trans`; `t` only labels log messages.
    pub fn build(&self, trans: Option<&Transform>, t: f64) -> Result<Decomposition> {
        let s = trans_sss_basis(&self.exp, &self.coils, trans, CoilScale::PerCoil(&self.coil_scale));
        let s = match &self.calibration {
            Some(cal) => cal.apply(s, &self.exp, trans, self.mag_scale),
            None => s,
        };
        let s = select_rows(&s, &self.good_rows);
        let reg = regularize(
            self.regularize,
            &self.exp,
            &s,
            &self.mag_or_fine,
            &self.stopping_rule,
            t,
        )?;
        let condition = reg.condition();
        log::debug!("    Decomposition condition number: {condition:.1}");
        self.bad_condition.check(condition)?;

        let mut basis = reg.basis;
        let mut pinv = reg.pinv;
        let scales: Vec<f64> = self.good_rows.iter().map(|&r| self.coil_scale[r]).collect();
        for (mut row, scale) in basis.row_iter_mut().zip(&scales) {
            row /= *scale;
        }
        for (mut col, scale) in pinv.column_iter_mut().zip(&scales) {
            col *= *scale;
        }
        Ok(Decomposition {
            basis,
            pinv,
            reg_moments: reg.reg_moments,
            n_use_in: reg.n_use_in,
            condition,
            trans: trans.cloned(),
        })
    }
}

/// Number of decompositions kept around; one for movement compensation and
/// one for the buffer-average pose used by the temporal projection.
const CACHE_SLOTS: usize = 2;

/// Reuses decompositions whose pose is unchanged.
#[derive(Debug)]
pub struct DecompositionCache {
    builder: DecompositionBuilder,
    /// Most recently used last
    entries: Vec<Rc<Decomposition>>,
    /// First decomposition built; its retained components go into the history
    first: Option<Rc<Decomposition>>,
    computed: usize,
}

impl DecompositionCache {
    pub fn new(builder: DecompositionBuilder) -> Self {
        Self {
            builder,
            entries: Vec::with_capacity(CACHE_SLOTS),
            first: None,
            computed: 0,
        }
    }

    pub fn first(&self) -> Option<&Rc<Decomposition>> {
        self.first.as_ref()
    }

    /// Decompositions built so far
    pub fn computed(&self) -> usize {
        self.computed
    }

    /// Decomposition for `trans`, built only if no cached entry has exactly this pose.
    pub fn get(&mut self, trans: Option<&Transform>, t: f64) -> Result<Rc<Decomposition>> {
        if let Some(pos) = self.entries.iter().position(|d| d.trans.as_ref() == trans) {
            let hit = self.entries.remove(pos);
            self.entries.push(Rc::clone(&hit));
            return Ok(hit);
        }
        let fresh = Rc::new(self.builder.build(trans, t)?);
        self.computed += 1;
        if self.first.is_none() {
            self.first = Some(Rc::clone(&fresh));
        }
        if self.entries.len() == CACHE_SLOTS {
            self.entries.remove(0);
        }
        self.entries.push(Rc::clone(&fresh));
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MaxwellError;
    use crate::geometry::prep_mf_coils;
    use crate::recording::MeasInfo;
    use crate::test_utils::{clustered_info, synthetic_info};
    use crate::types::{CoordFrame, Mat3, Vec3};
    use approx::assert_relative_eq;

    fn builder_for(info: &MeasInfo, int_order: usize, ext_order: usize, mode: Regularize) -> DecompositionBuilder {
        let coils = prep_mf_coils(info, false).unwrap();
        let coil_scale = coils
            .mag_mask
            .iter()
            .map(|&m| if m { 100.0 } else { 1.0 })
            .collect();
        DecompositionBuilder {
            exp: Expansion::new(Vec3::zeros(), int_order, ext_order),
            calibration: None,
            regularize: mode,
            stopping_rule: StoppingRule::default(),
            bad_condition: BadCondition::Warning,
            mag_scale: 100.0,
            coil_scale,
            good_rows: (0..coils.n_coils).collect(),
            mag_or_fine: coils.mag_mask.clone(),
            coils,
        }
    }

    fn shifted(z: f64) -> Transform {
        Transform::from_rotation_translation(
            CoordFrame::Meg,
            CoordFrame::Head,
            &Mat3::identity(),
            &Vec3::new(0.0, 0.0, z),
        )
    }

    #[test]
    fn test_pinv_inverts_basis_in_channel_units() {
        let info = synthetic_info(40, None);
        let decomp = builder_for(&info, 4, 2, Regularize::None).build(None, 0.0).unwrap();
        let n = decomp.reg_moments.len();
        assert_eq!(n, 24 + 8 + 0); // magnetometers present: no out terms dropped
        assert_relative_eq!(&decomp.pinv * &decomp.basis, DMatrix::identity(n, n), epsilon = 1e-8);
    }

    #[test]
    fn test_deterministic() {
        let info = synthetic_info(40, None);
        let builder = builder_for(&info, 5, 2, Regularize::In);
        let a = builder.build(Some(&shifted(0.01)), 0.0).unwrap();
        let b = builder.build(Some(&shifted(0.01)), 0.0).unwrap();
        assert_eq!(a.reg_moments, b.reg_moments);
        assert_eq!(a.basis, b.basis);
        assert_eq!(a.pinv, b.pinv);
    }

    #[test]
    fn test_bad_rows_are_dropped() {
        let info = synthetic_info(40, None);
        let mut builder = builder_for(&info, 4, 2, Regularize::None);
        builder.good_rows.retain(|&r| r != 5 && r != 17);
        let decomp = builder.build(None, 0.0).unwrap();
        assert_eq!(decomp.basis.nrows(), 118);
        assert_eq!(decomp.pinv.ncols(), 118);
    }

    #[test]
    fn test_round_trip_without_external_terms() {
        let info = synthetic_info(40, None);
        let decomp = builder_for(&info, 4, 0, Regularize::None).build(None, 0.0).unwrap();
        let moments = DMatrix::from_fn(24, 7, |r, c| ((r * 7 + c) as f64 * 0.37).sin() * 1e-8);
        let data = &decomp.basis * &moments;
        let back = decomp.internal_field(&data);
        assert_relative_eq!(back, data, epsilon = 1e-9 * data.amax());
        let (_, resid) = decomp.split(&data);
        assert!(resid.amax() < 1e-9 * data.amax());
    }

    #[test]
    fn test_ill_conditioned_geometry() {
        let info = clustered_info(16);
        let mut builder = builder_for(&info, 3, 1, Regularize::None);
        builder.bad_condition = BadCondition::Error;
        assert!(matches!(
            builder.build(None, 0.0),
            Err(MaxwellError::IllConditioned(_))
        ));
        builder.bad_condition = BadCondition::Ignore;
        let decomp = builder.build(None, 0.0).unwrap();
        assert!(decomp.condition >= 1000.0);
    }

    #[test]
    fn test_cache_reuses_identical_pose() {
        let info = synthetic_info(30, None);
        let mut cache = DecompositionCache::new(builder_for(&info, 3, 2, Regularize::None));
        assert!(cache.first().is_none());
        let a = cache.get(Some(&shifted(0.0)), 0.0).unwrap();
        let b = cache.get(Some(&shifted(0.0)), 1.0).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(cache.computed(), 1);

        cache.get(Some(&shifted(0.02)), 2.0).unwrap();
        assert_eq!(cache.computed(), 2);
        // both poses still cached
        cache.get(Some(&shifted(0.0)), 3.0).unwrap();
        assert_eq!(cache.computed(), 2);
        cache.get(Some(&shifted(0.03)), 4.0).unwrap();
        cache.get(Some(&shifted(0.02)), 5.0).unwrap();
        assert_eq!(cache.computed(), 4);
        assert!(Rc::ptr_eq(cache.first().unwrap(), &a));
    }
}
