//! Fine calibration.
//!
//! A fine-calibration dataset carries, per MEG channel, a corrected coil
//! orientation plus either a magnetometer calibration coefficient or one or
//! three gradiometer imbalance coefficients. Imbalances are modelled as
//! point-like magnetometers co-located with each gradiometer; their basis is
//! added to the gradiometer rows of the SSS basis.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use nalgebra::{DMatrix, Rotation3, Unit};
use serde::{Deserialize, Serialize};

use crate::basis::{trans_sss_basis, CoilScale, Expansion};
use crate::error::{MaxwellError, Result};
use crate::geometry::{coil_trans_from_loc, prep_mf_coils_with, Coil, CoilType, IntegrationPointSet};
use crate::recording::{MeasInfo, SssCal};
use crate::types::{Transform, Vec3, LOC_LEN};

/// Largest |ex.ez| or |ey.ez| still accepted as orthogonal
const ORTHOGONALITY_TOL: f64 = 1e-6;

/// One channel entry of a fine-calibration dataset
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FineCalChannel {
    pub ch_name: String,
    pub loc: [f64; LOC_LEN],
    /// Magnetometer calibration (1 value) or gradiometer imbalances (1 or 3 values)
    pub imb_cals: Vec<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FineCalibration {
    pub channels: Vec<FineCalChannel>,
}

impl FromStr for FineCalibration {
    type Err = MaxwellError;

    /// Whitespace separated text: channel number, 12 loc values, 1 or 3
    /// coefficients. Lines starting with `#` are comments.
    fn from_str(text: &str) -> Result<Self> {
        let mut channels = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let vals = line
                .split_whitespace()
                .map(|tok| {
                    tok.parse::<f64>().map_err(|_| {
                        MaxwellError::Calibration(format!(
                            "could not parse \"{tok}\" on line {}",
                            lineno + 1
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            if vals.len() != 14 && vals.len() != 16 {
                return Err(MaxwellError::Calibration(format!(
                    "line {} has {} entries, expected 14 or 16",
                    lineno + 1,
                    vals.len()
                )));
            }
            let mut loc = [0.0; LOC_LEN];
            loc.copy_from_slice(&vals[1..13]);
            channels.push(FineCalChannel {
                ch_name: format!("MEG{:04}", vals[0] as i64),
                loc,
                imb_cals: vals[13..].to_vec(),
            });
        }
        Ok(Self { channels })
    }
}

impl FineCalibration {
    pub fn read(path: &Path) -> Result<Self> {
        fs::read_to_string(path)?.parse()
    }
}

/// Calibration terms folded into the SSS basis.
#[derive(Clone, Debug)]
pub struct Calibration {
    /// `grad_imbalances[type][grad]` for x (and y, z) point magnetometers
    pub grad_imbalances: Vec<Vec<f64>>,
    pub grad_coilsets: Vec<IntegrationPointSet>,
    pub mag_cals: Vec<f64>,
    /// Basis rows of the calibrated gradiometers and magnetometers
    pub grad_rows: Vec<usize>,
    pub mag_rows: Vec<usize>,
}

impl Calibration {
    /// Point-magnetometer basis of every gradiometer, weighted by its imbalance.
    pub fn sss_basis_point(
        &self,
        exp: &Expansion,
        trans: Option<&Transform>,
        mag_scale: f64,
    ) -> DMatrix<f64> {
        let mut s_tot = DMatrix::zeros(self.grad_rows.len(), exp.n_total());
        for (imbalances, coils) in self.grad_imbalances.iter().zip(&self.grad_coilsets) {
            let mut s_add = trans_sss_basis(exp, coils, trans, CoilScale::Magnetometers(mag_scale));
            for (mut row, imb) in s_add.row_iter_mut().zip(imbalances) {
                row *= *imb;
            }
            s_tot += s_add;
        }
        s_tot
    }

    /// Add the imbalance terms to the gradiometer rows and divide the
    /// magnetometer rows by their calibration.
    pub fn apply(
        &self,
        mut s_decomp: DMatrix<f64>,
        exp: &Expansion,
        trans: Option<&Transform>,
        mag_scale: f64,
    ) -> DMatrix<f64> {
        let grad_cals = self.sss_basis_point(exp, trans, mag_scale);
        for (src, &row) in self.grad_rows.iter().enumerate() {
            let add = grad_cals.row(src).into_owned();
            let mut dst = s_decomp.row_mut(row);
            dst += add;
        }
        for (&row, cal) in self.mag_rows.iter().zip(&self.mag_cals) {
            let mut dst = s_decomp.row_mut(row);
            dst /= *cal;
        }
        s_decomp
    }
}

/// Result of applying a fine-calibration dataset to a recording's geometry.
#[derive(Clone, Debug)]
pub struct CalibratedGeometry {
    /// Measurement info with the calibrated coil orientations
    pub info: MeasInfo,
    pub calibration: Calibration,
    pub sss_cal: SssCal,
}

fn clean_name(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Rotation taking `from` onto `to`, also for anti-parallel vectors.
fn vector_rotation(from: &Vec3, to: &Vec3, perpendicular: &Vec3) -> Rotation3<f64> {
    Rotation3::rotation_between(from, to)
        .unwrap_or_else(|| Rotation3::from_axis_angle(&Unit::new_normalize(*perpendicular), PI))
}

fn point_coil_types(n_types: usize) -> Vec<CoilType> {
    [
        CoilType::PointMagnetometerX,
        CoilType::PointMagnetometerY,
        CoilType::PointMagnetometer,
    ]
    .into_iter()
    .take(n_types)
    .collect()
}

/// Replace coil orientations with the calibrated ones and collect the
/// calibration terms, indexed against the coil set built with `ignore_ref`.
pub fn update_sensor_geometry(
    info: &MeasInfo,
    fine_cal: &FineCalibration,
    ignore_ref: bool,
) -> Result<CalibratedGeometry> {
    log::info!("    Using fine calibration");
    let by_name: HashMap<String, usize> = info
        .channels
        .iter()
        .enumerate()
        .map(|(idx, ch)| (clean_name(&ch.name), idx))
        .collect();
    let meg_picks = info.meg_picks(false);
    let mut cal_for: HashMap<usize, &FineCalChannel> = HashMap::new();
    for entry in &fine_cal.channels {
        let Some(&idx) = by_name.get(&clean_name(&entry.ch_name)) else {
            log::debug!("        Calibration channel {} not in data", entry.ch_name);
            continue;
        };
        if entry.imb_cals.is_empty() {
            return Err(MaxwellError::Calibration(format!(
                "channel {} has no calibration coefficients",
                entry.ch_name
            )));
        }
        if !info.channels[idx].is_meg(false) {
            return Err(MaxwellError::Calibration(format!(
                "channel {} in calibration file is not an MEG channel in the data",
                entry.ch_name
            )));
        }
        cal_for.insert(idx, entry);
    }
    let missing: Vec<&str> = meg_picks
        .iter()
        .filter(|&&idx| !cal_for.contains_key(&idx))
        .map(|&idx| info.channels[idx].name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(MaxwellError::Calibration(format!(
            "not all MEG channels found in fine calibration file, missing: {missing:?}"
        )));
    }

    // rows refer to the coil set used for filtering (maybe with references)
    let mf_picks = info.meg_picks(!ignore_ref);
    let row_of = |idx: usize| mf_picks.iter().position(|&p| p == idx);
    let (grad_picks, mag_picks): (Vec<usize>, Vec<usize>) = meg_picks
        .iter()
        .copied()
        .partition(|&idx| !info.channels[idx].coil_type.is_tesla());

    let n_types = grad_picks
        .first()
        .map_or(1, |idx| cal_for[idx].imb_cals.len());
    if n_types != 1 && n_types != 3 {
        return Err(MaxwellError::Calibration(format!(
            "must have 1 (x) or 3 (x, y, z) point-like magnetometers, got {n_types}"
        )));
    }
    let mut grad_imbalances = vec![Vec::with_capacity(grad_picks.len()); n_types];
    for idx in &grad_picks {
        let cals = &cal_for[idx].imb_cals;
        if cals.len() != n_types {
            return Err(MaxwellError::Calibration(format!(
                "gradiometer {} has {} imbalance terms, expected {n_types}",
                info.channels[*idx].name,
                cals.len()
            )));
        }
        for (dst, value) in grad_imbalances.iter_mut().zip(cals) {
            dst.push(*value);
        }
    }
    let mag_cals: Vec<f64> = mag_picks.iter().map(|idx| cal_for[idx].imb_cals[0]).collect();

    // point magnetometers sit on the gradiometers as described before the update
    let grad_info = MeasInfo {
        channels: grad_picks.iter().map(|&idx| info.channels[idx].clone()).collect(),
        ..info.clone()
    };
    let grad_coilsets = point_coil_types(n_types)
        .iter()
        .map(|pt| prep_mf_coils_with(&grad_info, true, |ch| Coil::with_coil_type(ch, pt)))
        .collect::<Result<Vec<_>>>()?;

    let mut new_info = info.clone();
    let mut ang_shift = Vec::with_capacity(3 * meg_picks.len());
    let mut cal_corrs = Vec::with_capacity(meg_picks.len());
    let mut cal_chans = Vec::with_capacity(meg_picks.len());
    let mut adjust_logged = false;
    for &idx in &meg_picks {
        let entry = cal_for[&idx];
        let ch = &info.channels[idx];
        let (_, ch_rot) = coil_trans_from_loc(&ch.loc);
        let mut cal_loc = entry.loc;
        let (_, cal_rot) = coil_trans_from_loc(&cal_loc);
        let cal_ez = cal_rot.column(2).into_owned();
        let skew = (0..2)
            .map(|ii| cal_rot.column(ii).dot(&cal_ez).abs())
            .fold(0.0, f64::max);
        if skew > ORTHOGONALITY_TOL {
            if !adjust_logged {
                log::info!("        Adjusting non-orthogonal EX and EY");
                adjust_logged = true;
            }
            let rot = vector_rotation(
                &ch_rot.column(2).into_owned(),
                &cal_ez,
                &ch_rot.column(0).into_owned(),
            );
            let fixed = rot.matrix() * ch_rot;
            for (dst, v) in cal_loc[3..].iter_mut().zip(fixed.iter()) {
                *dst = *v;
            }
        }

        let (_, new_rot) = coil_trans_from_loc(&cal_loc);
        for axis in 0..3 {
            let a = new_rot.column(axis).normalize();
            let b = ch_rot.column(axis).normalize();
            ang_shift.push(a.dot(&b).clamp(-1.0, 1.0).acos().to_degrees());
        }
        let extra = if ch.coil_type.is_tesla() {
            [entry.imb_cals[0], 0.0]
        } else {
            [1.0, entry.imb_cals[0]]
        };
        cal_corrs.push(extra.iter().chain(cal_loc.iter()).copied().collect());
        cal_chans.push(ch.name.clone());
        new_info.channels[idx].loc[3..].copy_from_slice(&cal_loc[3..]);
    }

    let n = ang_shift.len().max(1) as f64;
    let mean = ang_shift.iter().sum::<f64>() / n;
    let std = (ang_shift.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    let max = ang_shift.iter().copied().fold(0.0, |acc: f64, v| acc.max(v.abs()));
    log::info!(
        "        Adjusted coil positions by (μ ± σ): {mean:.1}° ± {std:.1}° (max: {max:.1}°)"
    );

    let grad_rows = grad_picks.iter().filter_map(|&idx| row_of(idx)).collect();
    let mag_rows = mag_picks.iter().filter_map(|&idx| row_of(idx)).collect();
    Ok(CalibratedGeometry {
        info: new_info,
        calibration: Calibration {
            grad_imbalances,
            grad_coilsets,
            mag_cals,
            grad_rows,
            mag_rows,
        },
        sss_cal: SssCal {
            cal_corrs,
            cal_chans,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::sss_basis;
    use crate::geometry::prep_mf_coils;
    use crate::test_utils::synthetic_info;
    use approx::assert_relative_eq;

    fn fine_cal_text(info: &MeasInfo, grad_imb: &[f64], mag_cal: f64) -> String {
        let mut text = String::from("# synthetic fine calibration\n");
        for (idx, ch) in info.channels.iter().enumerate() {
            let coefs: Vec<f64> = if ch.coil_type.is_tesla() {
                vec![mag_cal]
            } else {
                grad_imb.to_vec()
            };
            let fields: Vec<String> = std::iter::once(format!("{}", idx + 1))
                .chain(ch.loc.iter().chain(&coefs).map(|v| format!("{v:e}")))
                .collect();
            text.push_str(&fields.join(" "));
            text.push('\n');
        }
        text
    }

    #[test]
    fn test_parse_fine_calibration() {
        let text = "# comment\n\n113 0 0 0.1 1 0 0 0 1 0 0 0 1 1.01\n\
                    112 0 0 0.1 1 0 0 0 1 0 0 0 1 0.1 0.2 0.3\n";
        let cal: FineCalibration = text.parse().unwrap();
        assert_eq!(cal.channels.len(), 2);
        assert_eq!(cal.channels[0].ch_name, "MEG0113");
        assert_eq!(cal.channels[0].imb_cals, vec![1.01]);
        assert_eq!(cal.channels[1].imb_cals.len(), 3);
        assert_relative_eq!(cal.channels[1].loc[2], 0.1);
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        let short = "113 0 0 0.1 1 0 0 0 1 0 0 0 1 1.0 2.0\n";
        assert!(matches!(
            short.parse::<FineCalibration>(),
            Err(MaxwellError::Calibration(_))
        ));
        let garbage = "113 0 0 x 1 0 0 0 1 0 0 0 1 1.0\n";
        assert!(matches!(
            garbage.parse::<FineCalibration>(),
            Err(MaxwellError::Calibration(_))
        ));
    }

    #[test]
    fn test_identity_calibration_keeps_basis() {
        let info = synthetic_info(8, None);
        let fine: FineCalibration = fine_cal_text(&info, &[0.0], 1.0).parse().unwrap();
        let cal = update_sensor_geometry(&info, &fine, false).unwrap();
        assert_eq!(cal.calibration.grad_rows.len(), 16);
        assert_eq!(cal.calibration.mag_rows, vec![0, 3, 6, 9, 12, 15, 18, 21]);
        assert_eq!(cal.sss_cal.cal_corrs.len(), 24);
        assert_eq!(cal.sss_cal.cal_corrs[1][..2], [1.0, 0.0]);

        let exp = Expansion::new(Vec3::zeros(), 3, 2);
        let coils = prep_mf_coils(&cal.info, false).unwrap();
        let raw = sss_basis(&exp, &coils);
        let corrected = cal.calibration.apply(raw.clone(), &exp, None, 100.0);
        assert_relative_eq!(corrected, raw, max_relative = 1e-14);
    }

    #[test]
    fn test_imbalance_adds_point_magnetometer_basis() {
        let info = synthetic_info(6, None);
        let fine: FineCalibration = fine_cal_text(&info, &[0.01], 2.0).parse().unwrap();
        let cal = update_sensor_geometry(&info, &fine, false).unwrap().calibration;
        assert_eq!(cal.grad_coilsets.len(), 1);

        let exp = Expansion::new(Vec3::zeros(), 2, 1);
        let coils = prep_mf_coils(&info, false).unwrap();
        let raw = sss_basis(&exp, &coils);
        let corrected = cal.apply(raw.clone(), &exp, None, 100.0);
        let point = sss_basis(&exp, &cal.grad_coilsets[0]);
        for (src, &row) in cal.grad_rows.iter().enumerate() {
            let expected = raw.row(row) + point.row(src) * (0.01 * 100.0);
            assert_relative_eq!(corrected.row(row).into_owned(), expected, max_relative = 1e-12);
        }
        for &row in &cal.mag_rows {
            assert_relative_eq!(corrected.row(row).into_owned(), raw.row(row) / 2.0, max_relative = 1e-14);
        }
    }

    #[test]
    fn test_three_point_coilsets() {
        let info = synthetic_info(3, None);
        let fine: FineCalibration = fine_cal_text(&info, &[0.01, 0.02, 0.03], 1.0).parse().unwrap();
        let cal = update_sensor_geometry(&info, &fine, true).unwrap().calibration;
        assert_eq!(cal.grad_coilsets.len(), 3);
        assert_eq!(cal.grad_imbalances[2], vec![0.03; 6]);
        // one point per gradiometer, along ex for the first set
        let set = &cal.grad_coilsets[0];
        assert_eq!(set.n_points(), 6);
        assert!(set.mag_mask.iter().all(|&m| m));
        let (_, rot) = coil_trans_from_loc(&info.channels[1].loc);
        assert_relative_eq!(set.cosmags[0], rot.column(0).into_owned(), epsilon = 1e-15);
    }

    #[test]
    fn test_non_orthogonal_axes_are_rotated() {
        let info = synthetic_info(2, None);
        let mut fine: FineCalibration = fine_cal_text(&info, &[0.0], 1.0).parse().unwrap();
        // tilt ez of the first channel, leave ex/ey alone
        let tilted = (Vec3::new(fine.channels[0].loc[9], fine.channels[0].loc[10], fine.channels[0].loc[11])
            + Vec3::new(fine.channels[0].loc[3], fine.channels[0].loc[4], fine.channels[0].loc[5]) * 0.05)
            .normalize();
        fine.channels[0].loc[9..].copy_from_slice(tilted.as_slice());
        let cal = update_sensor_geometry(&info, &fine, false).unwrap();
        let (pos, rot) = coil_trans_from_loc(&cal.info.channels[0].loc);
        let (orig_pos, _) = coil_trans_from_loc(&info.channels[0].loc);
        assert_eq!(pos, orig_pos);
        assert_relative_eq!(rot.column(2).into_owned(), tilted, epsilon = 1e-12);
        assert!(rot.column(0).dot(&rot.column(2)).abs() < 1e-12);
        assert!(rot.column(1).dot(&rot.column(2)).abs() < 1e-12);
    }

    #[test]
    fn test_missing_channel_is_fatal() {
        let info = synthetic_info(2, None);
        let mut fine: FineCalibration = fine_cal_text(&info, &[0.0], 1.0).parse().unwrap();
        fine.channels.pop();
        assert!(matches!(
            update_sensor_geometry(&info, &fine, false),
            Err(MaxwellError::Calibration(_))
        ));
    }
}
