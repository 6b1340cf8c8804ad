//! Synthetic sensor arrays and signals shared by the unit tests.

use nalgebra::DVector;
use ndarray::Array2;

use crate::geometry::{CoilType, IntegrationPointSet};
use crate::recording::{ChannelInfo, ChannelKind, MeasInfo};
use crate::types::{Transform, Vec3, LOC_LEN};

pub const SENSOR_RADIUS: f64 = 0.12;
pub const RADIUS_JITTER: f64 = 0.015;
pub const SFREQ: f64 = 200.0;

/// Channel `loc` with `ez = normal` and an arbitrary orthonormal in-plane pair.
pub fn loc_from_axes(pos: &Vec3, normal: &Vec3) -> [f64; LOC_LEN] {
    let ez = normal.normalize();
    let helper = if ez[2].abs() < 0.9 { Vec3::z() } else { Vec3::x() };
    let ex = helper.cross(&ez).normalize();
    let ey = ez.cross(&ex);
    let mut loc = [0.0; LOC_LEN];
    for (chunk, v) in loc.chunks_mut(3).zip([*pos, ex, ey, ez]) {
        chunk.copy_from_slice(v.as_slice());
    }
    loc
}

/// Directions spread over the sphere (Fibonacci lattice), never exactly on
/// the z axis, at radii jittered by up to `radius_jitter` around `radius`.
///
/// Sensors at a single radius cannot tell internal from external terms of
/// the same degree, hence the jitter.
pub fn sphere_points(n: usize, radius: f64, radius_jitter: f64) -> Vec<Vec3> {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let z = 1.0 - (2 * i + 1) as f64 / n as f64;
            let rho = (1.0 - z * z).sqrt();
            let theta = golden * i as f64;
            let shell = radius + radius_jitter * (2.0 * (i as f64 * 0.618_034).fract() - 1.0);
            Vec3::new(rho * theta.cos(), rho * theta.sin(), z) * shell
        })
        .collect()
}

/// Triplet array: one radial magnetometer and two orthogonal planar
/// gradiometers per location, all `Meg` channels named `MEG0001`, `MEG0002`...
pub fn synthetic_info(n_locations: usize, dev_head_t: Option<Transform>) -> MeasInfo {
    let mut channels = Vec::with_capacity(3 * n_locations);
    for pos in sphere_points(n_locations, SENSOR_RADIUS, RADIUS_JITTER) {
        let loc = loc_from_axes(&pos, &pos);
        // second gradiometer is turned 90 degrees about ez
        let mut rotated = loc;
        rotated[3..6].copy_from_slice(&loc[6..9]);
        rotated[6..9].copy_from_slice(&[-loc[3], -loc[4], -loc[5]]);
        for (coil_type, loc) in [
            (CoilType::Magnetometer, loc),
            (CoilType::PlanarGradiometer, loc),
            (CoilType::PlanarGradiometer, rotated),
        ] {
            channels.push(ChannelInfo {
                name: format!("MEG{:04}", channels.len() + 1),
                kind: ChannelKind::Meg,
                coil_type,
                loc,
            });
        }
    }
    MeasInfo {
        sfreq: SFREQ,
        channels,
        bads: Vec::new(),
        dev_head_t,
        projs: Vec::new(),
        comp_grade: 0,
        dig: Vec::new(),
        proc_history: Vec::new(),
    }
}

/// Coil outputs for a spatially uniform field `b` [T].
pub fn uniform_field_response(coils: &IntegrationPointSet, b: &Vec3) -> DVector<f64> {
    let mut out = DVector::zeros(coils.n_coils);
    for (cosmag, &bin) in coils.cosmags.iter().zip(&coils.bins) {
        out[bin] += cosmag.dot(b);
    }
    out
}

/// Deterministic, aperiodic-looking signal; rows use different frequencies.
pub fn pseudo_signal(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let f1 = 0.013 * (r as f64 + 1.0) + 0.001 * seed as f64;
        let f2 = 0.071 * (r as f64 + 2.0).sqrt();
        (f1 * c as f64).sin() + 0.5 * (f2 * c as f64 + seed as f64).cos()
    })
}

/// Triplets packed into a 2 cm patch above the origin; far too small an
/// aperture to resolve anything beyond the lowest degrees.
pub fn clustered_info(n_locations: usize) -> MeasInfo {
    let side = (n_locations as f64).sqrt().ceil() as usize;
    let step = 0.02 / side as f64;
    let mut info = synthetic_info(n_locations, None);
    for (idx, ch) in info.channels.iter_mut().enumerate() {
        let k = idx / 3;
        let pos = Vec3::new(
            (k % side) as f64 * step,
            (k / side) as f64 * step,
            SENSOR_RADIUS,
        );
        let loc = loc_from_axes(&pos, &Vec3::z());
        ch.loc[..3].copy_from_slice(&loc[..3]);
        if idx % 3 != 2 {
            ch.loc[3..].copy_from_slice(&loc[3..]);
        } else {
            ch.loc[3..6].copy_from_slice(&loc[6..9]);
            ch.loc[6..9].copy_from_slice(&[-loc[3], -loc[4], -loc[5]]);
            ch.loc[9..].copy_from_slice(&loc[9..]);
        }
    }
    info
}
