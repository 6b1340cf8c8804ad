//! Sensor integration geometry.
//!
//! Every MEG channel is modelled as a coil: a small set of integration points
//! (position, unit normal, quadrature weight) defined in the coil frame and
//! placed in the device frame by the channel's 12-element `loc`.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{MaxwellError, Result};
use crate::recording::{ChannelInfo, ChannelKind, MeasInfo};
use crate::types::{Mat3, Transform, Vec3, LOC_LEN};

// ===== Coil template constants =====
/// Half side length of the square magnetometer loop [m]
pub const MAG_HALF_SIDE: f64 = 0.00645;
/// Distance between planar gradiometer pickup loops [m]
pub const PLANAR_GRAD_BASE: f64 = 0.0168;
/// Distance between axial gradiometer pickup loops [m]
pub const AXIAL_GRAD_BASE: f64 = 0.050;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoilClass {
    Magnetometer,
    AxialGradiometer,
    PlanarGradiometer,
}

/// One integration point in the coil frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationPoint {
    pub position: [f64; 3],
    pub normal: [f64; 3],
    pub weight: f64,
}

impl IntegrationPoint {
    fn new(position: [f64; 3], normal: [f64; 3], weight: f64) -> Self {
        Self {
            position,
            normal,
            weight,
        }
    }
}

/// Sensor coil definitions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoilType {
    /// Not a magnetic sensor
    None,
    /// Point magnetometer measuring along ez
    PointMagnetometer,
    /// Point magnetometer measuring along ex
    PointMagnetometerX,
    /// Point magnetometer measuring along ey
    PointMagnetometerY,
    /// Square-loop magnetometer
    Magnetometer,
    /// Planar gradiometer, gradient along ex
    PlanarGradiometer,
    /// First-order axial gradiometer (reports tesla)
    AxialGradiometer,
    /// Integration points supplied with the channel
    Custom {
        class: CoilClass,
        tesla_units: bool,
        #[serde(default)]
        base: f64,
        points: Vec<IntegrationPoint>,
    },
}

impl CoilType {
    pub fn class(&self) -> Option<CoilClass> {
        match self {
            CoilType::None => None,
            CoilType::PointMagnetometer
            | CoilType::PointMagnetometerX
            | CoilType::PointMagnetometerY
            | CoilType::Magnetometer => Some(CoilClass::Magnetometer),
            CoilType::PlanarGradiometer => Some(CoilClass::PlanarGradiometer),
            CoilType::AxialGradiometer => Some(CoilClass::AxialGradiometer),
            CoilType::Custom { class, .. } => Some(*class),
        }
    }

    /// Whether the channel is reported in T (as opposed to T/m)
    pub fn is_tesla(&self) -> bool {
        match self {
            CoilType::PlanarGradiometer => false,
            CoilType::Custom { tesla_units, .. } => *tesla_units,
            _ => true,
        }
    }

    /// Axial gradiometers report tesla but are not magnetometers
    pub fn is_axial_gradiometer(&self) -> bool {
        self.class() == Some(CoilClass::AxialGradiometer)
    }

    /// Distance between pickup loops, zero for magnetometers
    pub fn base(&self) -> f64 {
        match self {
            CoilType::PlanarGradiometer => PLANAR_GRAD_BASE,
            CoilType::AxialGradiometer => AXIAL_GRAD_BASE,
            CoilType::Custom { base, .. } => *base,
            _ => 0.0,
        }
    }

    /// Integration points in the coil frame
    pub fn template(&self) -> Vec<IntegrationPoint> {
        let ez = [0.0, 0.0, 1.0];
        match self {
            CoilType::None => Vec::new(),
            CoilType::PointMagnetometer => vec![IntegrationPoint::new([0.0; 3], ez, 1.0)],
            CoilType::PointMagnetometerX => {
                vec![IntegrationPoint::new([0.0; 3], [1.0, 0.0, 0.0], 1.0)]
            }
            CoilType::PointMagnetometerY => {
                vec![IntegrationPoint::new([0.0; 3], [0.0, 1.0, 0.0], 1.0)]
            }
            CoilType::Magnetometer => {
                let d = MAG_HALF_SIDE;
                [(d, d), (-d, d), (d, -d), (-d, -d)]
                    .iter()
                    .map(|&(x, y)| IntegrationPoint::new([x, y, 0.0], ez, 0.25))
                    .collect()
            }
            CoilType::PlanarGradiometer => {
                let half = PLANAR_GRAD_BASE / 2.0;
                let w = 1.0 / PLANAR_GRAD_BASE;
                vec![
                    IntegrationPoint::new([half, 0.0, 0.0], ez, w),
                    IntegrationPoint::new([-half, 0.0, 0.0], ez, -w),
                ]
            }
            CoilType::AxialGradiometer => vec![
                IntegrationPoint::new([0.0; 3], ez, 1.0),
                IntegrationPoint::new([0.0, 0.0, AXIAL_GRAD_BASE], ez, -1.0),
            ],
            CoilType::Custom { points, .. } => points.clone(),
        }
    }
}

/// Coil -> device rotation (columns ex, ey, ez) and origin from a channel `loc`.
pub fn coil_trans_from_loc(loc: &[f64; LOC_LEN]) -> (Vec3, Mat3) {
    let r0 = Vec3::new(loc[0], loc[1], loc[2]);
    let ex = Vec3::new(loc[3], loc[4], loc[5]);
    let ey = Vec3::new(loc[6], loc[7], loc[8]);
    let ez = Vec3::new(loc[9], loc[10], loc[11]);
    (r0, Mat3::from_columns(&[ex, ey, ez]))
}

/// A coil placed in the device frame
#[derive(Clone, Debug)]
pub struct Coil {
    pub ch_name: String,
    pub class: CoilClass,
    pub base: f64,
    pub rmag: Vec<Vec3>,
    pub cosmag: Vec<Vec3>,
    pub w: Vec<f64>,
}

impl Coil {
    pub fn from_channel(ch: &ChannelInfo) -> Result<Self> {
        Self::with_coil_type(ch, &ch.coil_type)
    }

    /// Place `coil_type` at the location of `ch` (used for point-like calibration coils).
    pub fn with_coil_type(ch: &ChannelInfo, coil_type: &CoilType) -> Result<Self> {
        let class = coil_type.class().ok_or_else(|| {
            MaxwellError::InvalidRecording(format!("channel {} has no coil definition", ch.name))
        })?;
        if ch.loc.iter().any(|v| !v.is_finite()) {
            return Err(MaxwellError::InvalidRecording(format!(
                "channel {} has a non-finite location",
                ch.name
            )));
        }
        let (r0, rot) = coil_trans_from_loc(&ch.loc);
        let template = coil_type.template();
        let rmag = template
            .iter()
            .map(|p| rot * Vec3::from(p.position) + r0)
            .collect();
        let cosmag = template.iter().map(|p| rot * Vec3::from(p.normal)).collect();
        let w = template.iter().map(|p| p.weight).collect();
        Ok(Self {
            ch_name: ch.name.clone(),
            class,
            base: coil_type.base(),
            rmag,
            cosmag,
            w,
        })
    }

    pub fn n_points(&self) -> usize {
        self.rmag.len()
    }
}

/// Concatenated integration points of an ordered coil list.
///
/// `cosmags` already carry the quadrature weights. `bins[i]` is the coil that
/// owns point `i`; points of one coil are contiguous (`slices[coil]`).
#[derive(Clone, Debug)]
pub struct IntegrationPointSet {
    pub rmags: Vec<Vec3>,
    pub cosmags: Vec<Vec3>,
    pub bins: Vec<usize>,
    pub n_coils: usize,
    pub mag_mask: Vec<bool>,
    pub slices: Vec<Range<usize>>,
}

impl IntegrationPointSet {
    pub fn from_coils(coils: &[Coil]) -> Self {
        let n_total: usize = coils.iter().map(Coil::n_points).sum();
        let mut rmags = Vec::with_capacity(n_total);
        let mut cosmags = Vec::with_capacity(n_total);
        let mut bins = Vec::with_capacity(n_total);
        let mut slices = Vec::with_capacity(coils.len());
        for (idx, coil) in coils.iter().enumerate() {
            let start = rmags.len();
            for ((r, c), w) in coil.rmag.iter().zip(&coil.cosmag).zip(&coil.w) {
                rmags.push(*r);
                cosmags.push(c * *w);
                bins.push(idx);
            }
            slices.push(start..rmags.len());
        }
        Self {
            rmags,
            cosmags,
            bins,
            n_coils: coils.len(),
            mag_mask: coils
                .iter()
                .map(|c| c.class == CoilClass::Magnetometer)
                .collect(),
            slices,
        }
    }

    pub fn n_points(&self) -> usize {
        self.rmags.len()
    }

    /// Same points expressed in another frame; normals rotate but do not move.
    pub fn transformed(&self, trans: &Transform) -> Self {
        Self {
            rmags: self.rmags.iter().map(|r| trans.apply_point(r)).collect(),
            cosmags: self.cosmags.iter().map(|c| trans.apply_vector(c)).collect(),
            ..self.clone()
        }
    }
}

/// Build the coil set used for Maxwell filtering.
///
/// MEG coils and reference (compensation) coils are created separately and
/// merged back together in channel order.
pub fn prep_mf_coils(info: &MeasInfo, ignore_ref: bool) -> Result<IntegrationPointSet> {
    prep_mf_coils_with(info, ignore_ref, Coil::from_channel)
}

/// As [`prep_mf_coils`], with a custom coil factory per channel.
pub fn prep_mf_coils_with<F>(info: &MeasInfo, ignore_ref: bool, make: F) -> Result<IntegrationPointSet>
where
    F: Fn(&ChannelInfo) -> Result<Coil>,
{
    let mut coils = Vec::new();
    let mut comp_coils = Vec::new();
    for (idx, ch) in info.channels.iter().enumerate() {
        match ch.kind {
            ChannelKind::Meg => coils.push((idx, make(ch)?)),
            ChannelKind::RefMeg if !ignore_ref => comp_coils.push((idx, make(ch)?)),
            _ => {}
        }
    }
    if !comp_coils.is_empty() {
        coils.extend(comp_coils);
        coils.sort_by_key(|(idx, _)| *idx);
    }
    let coils: Vec<Coil> = coils.into_iter().map(|(_, coil)| coil).collect();
    Ok(IntegrationPointSet::from_coils(&coils))
}
