//! Filter options.
//!
//! `MaxwellParams` is an immutable value: every derived quantity (origin,
//! magnetometer gain, destination pose) is resolved from it against a
//! `MeasInfo` and returned, never written back.

use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::calibration::FineCalibration;
use crate::crosstalk::CrossTalk;
use crate::error::{MaxwellError, Result};
use crate::pose::HeadPosition;
use crate::recording::MeasInfo;
use crate::regularize::{Regularize, StoppingRule};
use crate::types::{CoordFrame, Mat3, Transform, Vec3};

/// Largest allowed condition number of a decomposition
pub const MAX_CONDITION: f64 = 1000.0;
/// Minimum number of digitised points for the automatic origin
const MIN_FIT_POINTS: usize = 4;

/// Expansion origin
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Sphere fit to the digitised head points (head frame), zero otherwise
    #[default]
    Auto,
    /// Fixed point [m], in the chosen coordinate frame
    Fixed([f64; 3]),
}

/// Pose the data are reconstructed at
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// Device -> head translation [m] with the identity rotation
    Translation([f64; 3]),
    /// Full device -> head transform
    Transform(Transform),
}

/// What to do when a decomposition is ill-conditioned
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadCondition {
    #[default]
    Error,
    Warning,
    Ignore,
}

impl FromStr for BadCondition {
    type Err = MaxwellError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "error" => Ok(BadCondition::Error),
            "warning" => Ok(BadCondition::Warning),
            "ignore" => Ok(BadCondition::Ignore),
            other => Err(MaxwellError::UnsupportedMode(format!(
                "bad_condition must be \"error\", \"warning\" or \"ignore\", got \"{other}\""
            ))),
        }
    }
}

impl BadCondition {
    /// Apply the policy to a condition number.
    pub fn check(&self, condition: f64) -> Result<()> {
        if condition < MAX_CONDITION {
            return Ok(());
        }
        match self {
            BadCondition::Error => Err(MaxwellError::IllConditioned(condition)),
            BadCondition::Warning => {
                log::warn!("Matrix is badly conditioned: {condition:.0} >= {MAX_CONDITION:.0}");
                Ok(())
            }
            BadCondition::Ignore => Ok(()),
        }
    }
}

/// Magnetometer gain relative to gradiometers
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MagScale {
    Value(f64),
    /// `1 / baseline` of the gradiometers present
    Auto,
}

impl Default for MagScale {
    fn default() -> Self {
        MagScale::Value(100.0)
    }
}

impl FromStr for MagScale {
    type Err = MaxwellError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "auto" {
            return Ok(MagScale::Auto);
        }
        s.parse::<f64>().map(MagScale::Value).map_err(|_| {
            MaxwellError::UnsupportedMode(format!(
                "mag_scale must be a number or \"auto\", got \"{s}\""
            ))
        })
    }
}

impl fmt::Display for MagScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MagScale::Value(v) => write!(f, "{v}"),
            MagScale::Auto => f.write_str("auto"),
        }
    }
}

impl MagScale {
    /// Numeric gain for the MEG channels `meg_picks` of `info`.
    pub fn resolve(&self, info: &MeasInfo, meg_picks: &[usize]) -> Result<f64> {
        let scale = match self {
            MagScale::Value(v) => *v,
            MagScale::Auto => {
                let (mags, grads): (Vec<usize>, Vec<usize>) = meg_picks
                    .iter()
                    .copied()
                    .partition(|&idx| info.channels[idx].coil_type.is_tesla());
                if mags.is_empty() || grads.is_empty() {
                    100.0
                } else {
                    let mut bases: Vec<f64> = grads
                        .iter()
                        .map(|&idx| info.channels[idx].coil_type.base())
                        .collect();
                    bases.sort_by(f64::total_cmp);
                    bases.dedup();
                    match bases.as_slice() {
                        [base] if *base > 0.0 => 1.0 / base,
                        _ => {
                            return Err(MaxwellError::MagScale(format!(
                                "found {} distinct gradiometer baselines {bases:?}, expected one positive value",
                                bases.len()
                            )))
                        }
                    }
                }
            }
        };
        if !(scale.is_finite() && scale > 0.0) {
            return Err(MaxwellError::InvalidParameter(format!(
                "mag_scale must be positive, got {scale}"
            )));
        }
        Ok(scale)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxwellParams {
    // ── Expansion ──
    pub origin: Origin,
    pub int_order: usize,
    pub ext_order: usize,
    pub coord_frame: CoordFrame,
    pub regularize: Regularize,
    pub stopping_rule: StoppingRule,
    pub bad_condition: BadCondition,
    pub mag_scale: MagScale,
    pub ignore_ref: bool,

    // ── Sensor corrections ──
    pub calibration: Option<FineCalibration>,
    pub cross_talk: Option<CrossTalk>,

    // ── Movement ──
    pub destination: Option<Destination>,
    pub head_pos: Option<Vec<HeadPosition>>,

    // ── Temporal projection ──
    /// Buffer length [s]; enables tSSS
    pub st_duration: Option<f64>,
    pub st_correlation: f64,
    pub st_fixed: bool,
    pub st_only: bool,
}

impl Default for MaxwellParams {
    fn default() -> Self {
        Self {
            origin: Origin::Auto,
            int_order: 8,
            ext_order: 3,
            coord_frame: CoordFrame::Head,
            regularize: Regularize::In,
            stopping_rule: StoppingRule::default(),
            bad_condition: BadCondition::Error,
            mag_scale: MagScale::default(),
            ignore_ref: false,
            calibration: None,
            cross_talk: None,
            destination: None,
            head_pos: None,
            st_duration: None,
            st_correlation: 0.98,
            st_fixed: true,
            st_only: false,
        }
    }
}

impl MaxwellParams {
    /// Checks that need nothing but the options and the measurement info.
    pub fn validate(&self, info: &MeasInfo) -> Result<()> {
        if !(self.st_correlation > 0.0 && self.st_correlation <= 1.0) {
            return Err(MaxwellError::InvalidParameter(format!(
                "st_correlation must be in (0, 1], got {}",
                self.st_correlation
            )));
        }
        if self.int_order == 0 {
            return Err(MaxwellError::InvalidParameter(
                "int_order must be at least 1".to_string(),
            ));
        }
        if !(self.stopping_rule.plateau_fraction > 0.0 && self.stopping_rule.plateau_fraction <= 1.0) {
            return Err(MaxwellError::InvalidParameter(format!(
                "plateau_fraction must be in (0, 1], got {}",
                self.stopping_rule.plateau_fraction
            )));
        }
        if self.coord_frame == CoordFrame::Unknown {
            return Err(MaxwellError::UnknownFrame(
                "coord_frame must be either \"head\" or \"meg\"".to_string(),
            ));
        }
        if self.coord_frame == CoordFrame::Head && info.dev_head_t.is_none() {
            return Err(MaxwellError::InvalidParameter(
                "coord_frame cannot be \"head\" because the recording has no device -> head transform"
                    .to_string(),
            ));
        }
        if self.st_only && self.st_duration.is_none() {
            return Err(MaxwellError::InvalidParameter(
                "st_duration must not be None if st_only is true".to_string(),
            ));
        }
        self.resolve_destination(info)?;
        Ok(())
    }

    /// Device -> head pose of the reconstruction.
    ///
    /// Without a destination this is the recording's own transform.
    pub fn resolve_destination(&self, info: &MeasInfo) -> Result<Option<Transform>> {
        let Some(destination) = &self.destination else {
            return Ok(info.dev_head_t.clone());
        };
        if self.coord_frame != CoordFrame::Head {
            return Err(MaxwellError::InvalidParameter(
                "destination can only be set if using the head coordinate frame".to_string(),
            ));
        }
        let trans = match destination {
            Destination::Translation(t) => Transform::from_rotation_translation(
                CoordFrame::Meg,
                CoordFrame::Head,
                &Mat3::identity(),
                &Vec3::from(*t),
            ),
            Destination::Transform(trans) => trans.clone(),
        };
        if trans.from != CoordFrame::Meg || trans.to != CoordFrame::Head {
            return Err(MaxwellError::InvalidParameter(format!(
                "destination must be a MEG device -> head transform, got {:?} -> {:?}",
                trans.from, trans.to
            )));
        }
        if !trans.is_finite() {
            return Err(MaxwellError::InvalidParameter(
                "destination transform must be finite".to_string(),
            ));
        }
        Ok(Some(trans))
    }

    /// Expansion origin in the chosen frame [m].
    pub fn resolve_origin(&self, info: &MeasInfo) -> Result<Vec3> {
        let origin = match self.origin {
            Origin::Fixed(origin) => Vec3::from(origin),
            Origin::Auto => match self.coord_frame {
                CoordFrame::Head => {
                    let (radius, center) = fit_sphere(&info.dig)?;
                    log::info!(
                        "    Fitted sphere radius: {:.1} mm, origin head: {:.1} {:.1} {:.1} mm",
                        radius * 1e3,
                        center[0] * 1e3,
                        center[1] * 1e3,
                        center[2] * 1e3
                    );
                    center
                }
                _ => Vec3::zeros(),
            },
        };
        if !origin.iter().all(|v| v.is_finite()) {
            return Err(MaxwellError::InvalidParameter(format!(
                "origin must be finite, got {origin:?}"
            )));
        }
        Ok(origin)
    }
}

/// Least-squares sphere through `points`: `(radius, center)`.
///
/// Solves `|p|^2 = 2 p.c + (r^2 - |c|^2)` for `c` and `r`.
pub fn fit_sphere(points: &[[f64; 3]]) -> Result<(f64, Vec3)> {
    if points.len() < MIN_FIT_POINTS {
        return Err(MaxwellError::InvalidParameter(format!(
            "need at least {MIN_FIT_POINTS} digitised head points to fit a sphere, got {}",
            points.len()
        )));
    }
    let a = DMatrix::from_fn(points.len(), 4, |r, c| match c {
        3 => 1.0,
        _ => 2.0 * points[r][c],
    });
    let b = DVector::from_iterator(
        points.len(),
        points.iter().map(|p| p.iter().map(|v| v * v).sum::<f64>()),
    );
    let sol = a
        .svd(true, true)
        .solve(&b, 1e-12)
        .map_err(|e| MaxwellError::Numerical(format!("sphere fit failed: {e}")))?;
    let center = Vec3::new(sol[0], sol[1], sol[2]);
    let r2 = sol[3] + center.norm_squared();
    if !(r2 > 0.0) {
        return Err(MaxwellError::Numerical(
            "sphere fit produced a non-positive radius".to_string(),
        ));
    }
    Ok((r2.sqrt(), center))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::CoilType;
    use crate::test_utils::{sphere_points, synthetic_info};
    use approx::assert_relative_eq;

    fn head_info() -> MeasInfo {
        synthetic_info(4, Some(Transform::identity(CoordFrame::Meg, CoordFrame::Head)))
    }

    #[test]
    fn test_string_options() {
        assert_eq!("warning".parse::<BadCondition>().unwrap(), BadCondition::Warning);
        assert!(matches!(
            "fail".parse::<BadCondition>(),
            Err(MaxwellError::UnsupportedMode(_))
        ));
        assert_eq!("auto".parse::<MagScale>().unwrap(), MagScale::Auto);
        assert_eq!("59.5".parse::<MagScale>().unwrap(), MagScale::Value(59.5));
        assert!("big".parse::<MagScale>().is_err());
    }

    #[test]
    fn test_bad_condition_policy() {
        assert!(BadCondition::Error.check(999.0).is_ok());
        assert!(matches!(
            BadCondition::Error.check(1e4),
            Err(MaxwellError::IllConditioned(_))
        ));
        assert!(BadCondition::Warning.check(1e4).is_ok());
        assert!(BadCondition::Ignore.check(f64::INFINITY).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        let info = head_info();
        assert!(MaxwellParams::default().validate(&info).is_ok());

        let params = MaxwellParams {
            st_correlation: 1.5,
            ..Default::default()
        };
        assert!(matches!(params.validate(&info), Err(MaxwellError::InvalidParameter(_))));

        let params = MaxwellParams {
            coord_frame: CoordFrame::Unknown,
            ..Default::default()
        };
        assert!(matches!(params.validate(&info), Err(MaxwellError::UnknownFrame(_))));

        let params = MaxwellParams {
            st_only: true,
            ..Default::default()
        };
        assert!(params.validate(&info).is_err());

        // head frame needs a device -> head transform
        assert!(MaxwellParams::default().validate(&synthetic_info(4, None)).is_err());
    }

    #[test]
    fn test_destination() {
        let info = head_info();
        let params = MaxwellParams {
            destination: Some(Destination::Translation([0.0, 0.0, 0.04])),
            ..Default::default()
        };
        let trans = params.resolve_destination(&info).unwrap().unwrap();
        assert_eq!(trans.rotation(), Mat3::identity());
        assert_relative_eq!(trans.translation(), Vec3::new(0.0, 0.0, 0.04));

        let meg_frame = MaxwellParams {
            coord_frame: CoordFrame::Meg,
            ..params.clone()
        };
        assert!(meg_frame.resolve_destination(&info).is_err());

        let wrong = MaxwellParams {
            destination: Some(Destination::Transform(Transform::identity(
                CoordFrame::Head,
                CoordFrame::Meg,
            ))),
            ..Default::default()
        };
        assert!(wrong.resolve_destination(&info).is_err());

        let none = MaxwellParams::default();
        assert_eq!(none.resolve_destination(&info).unwrap(), info.dev_head_t);
    }

    #[test]
    fn test_sphere_fit_origin() {
        let center = Vec3::new(0.001, -0.004, 0.042);
        let mut info = head_info();
        info.dig = sphere_points(40, 0.09, 0.0)
            .iter()
            .map(|p| (p + center).into())
            .collect();
        let (radius, fitted) = fit_sphere(&info.dig).unwrap();
        assert_relative_eq!(radius, 0.09, epsilon = 1e-10);
        assert_relative_eq!(fitted, center, epsilon = 1e-10);
        assert_relative_eq!(MaxwellParams::default().resolve_origin(&info).unwrap(), center, epsilon = 1e-10);

        info.dig.truncate(3);
        assert!(MaxwellParams::default().resolve_origin(&info).is_err());
        let meg = MaxwellParams {
            coord_frame: CoordFrame::Meg,
            ..Default::default()
        };
        assert_eq!(meg.resolve_origin(&info).unwrap(), Vec3::zeros());
    }

    #[test]
    fn test_auto_mag_scale() {
        let info = synthetic_info(3, None);
        let picks = info.meg_picks(false);
        let scale = MagScale::Auto.resolve(&info, &picks).unwrap();
        assert_relative_eq!(scale, 1.0 / CoilType::PlanarGradiometer.base());

        let mags: Vec<usize> = picks
            .iter()
            .copied()
            .filter(|&idx| info.channels[idx].coil_type.is_tesla())
            .collect();
        assert_eq!(MagScale::Auto.resolve(&info, &mags).unwrap(), 100.0);

        let mut mixed = info.clone();
        mixed.channels[1].coil_type = CoilType::Custom {
            class: crate::geometry::CoilClass::PlanarGradiometer,
            tesla_units: false,
            base: 0.02,
            points: Vec::new(),
        };
        assert!(matches!(
            MagScale::Auto.resolve(&mixed, &picks),
            Err(MaxwellError::MagScale(_))
        ));
    }

    #[test]
    fn test_params_json_defaults() {
        let params: MaxwellParams =
            serde_json::from_str(r#"{"int_order": 6, "regularize": "none", "origin": {"fixed": [0.0, 0.0, 0.04]}}"#)
                .unwrap();
        assert_eq!(params.int_order, 6);
        assert_eq!(params.ext_order, 3);
        assert_eq!(params.regularize, Regularize::None);
        assert_eq!(params.origin, Origin::Fixed([0.0, 0.0, 0.04]));
    }
}
