//! Head position stream.
//!
//! Positions arrive as `(t, q1, q2, q3, x, y, z, gof, err, vel)` rows. They
//! are validated once, converted to sample indices, and then cut into
//! per-buffer segments that tile the buffer exactly.

use serde::{Deserialize, Serialize};

use crate::error::{MaxwellError, Result};
use crate::types::{quat_to_rot, rot_to_quat, CoordFrame, Transform, Vec3};

/// Columns of a head position row
pub const POS_COLUMNS: usize = 10;
/// Values written to the position channels per sample
pub const POS_DATA_LEN: usize = 9;
/// Slack on the first time point: positions are stored with ms precision [s]
const TIME_SLACK: f64 = 1e-3;
/// Translations beyond this are suspicious [m]
const MAX_SANE_DISTANCE: f64 = 1.0;

pub type PosData = [f64; POS_DATA_LEN];

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeadPosition {
    /// Time relative to acquisition start [s]
    pub t: f64,
    /// Vector part of the rotation quaternion
    pub quat: [f64; 3],
    /// Device -> head translation [m]
    pub trans: [f64; 3],
    /// Goodness of fit
    pub gof: f64,
    /// Fit error [m]
    pub err: f64,
    /// Velocity [m/s]
    pub vel: f64,
}

impl HeadPosition {
    pub fn from_row(row: &[f64]) -> Result<Self> {
        if row.len() != POS_COLUMNS {
            return Err(MaxwellError::InvalidPose(format!(
                "pos must be an array of shape (N, {POS_COLUMNS}), found a row of length {}",
                row.len()
            )));
        }
        Ok(Self {
            t: row[0],
            quat: [row[1], row[2], row[3]],
            trans: [row[4], row[5], row[6]],
            gof: row[7],
            err: row[8],
            vel: row[9],
        })
    }

    /// Parse an `(N, 10)` array.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Vec<Self>> {
        rows.iter().map(|row| Self::from_row(row)).collect()
    }

    pub fn dev_head_t(&self) -> Transform {
        Transform::from_rotation_translation(
            CoordFrame::Meg,
            CoordFrame::Head,
            &quat_to_rot(&Vec3::from(self.quat)),
            &Vec3::from(self.trans),
        )
    }

    /// Quaternion, translation and fit quality, as written to the position channels.
    pub fn pos_data(&self) -> PosData {
        let [q1, q2, q3] = self.quat;
        let [x, y, z] = self.trans;
        [q1, q2, q3, x, y, z, self.gof, self.err, self.vel]
    }
}

/// Position channel values for a static device -> head transform.
pub fn pos_data_from_trans(trans: &Transform) -> PosData {
    let q = rot_to_quat(&trans.rotation());
    let t = trans.translation();
    [q[0], q[1], q[2], t[0], t[1], t[2], 0.0, 0.0, 0.0]
}

#[derive(Clone, Debug, PartialEq)]
struct PoseSample {
    sample: i64,
    trans: Transform,
    pos_data: PosData,
}

/// Validated positions on the recording's sample grid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoseStream {
    samples: Vec<PoseSample>,
}

/// Part of a buffer covered by one pose.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    /// `None`: keep whatever decomposition applied before this segment
    pub trans: Option<Transform>,
    /// Buffer-relative sample range
    pub start: usize,
    pub stop: usize,
    pub pos_data: Option<PosData>,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BufferPlan {
    pub segments: Vec<Segment>,
    /// Duration-weighted average pose over the buffer
    pub avg_trans: Option<Transform>,
}

impl PoseStream {
    /// Check the positions and convert their times to sample indices.
    ///
    /// `first_samp` is the index of the recording's first sample relative to
    /// acquisition start; positions at or after `n_samples` are dropped.
    pub fn new(
        positions: &[HeadPosition],
        coord_frame: CoordFrame,
        st_fixed: bool,
        first_samp: usize,
        n_samples: usize,
        sfreq: f64,
    ) -> Result<Self> {
        if coord_frame != CoordFrame::Head {
            return Err(MaxwellError::InvalidPose(
                "positions can only be used if coord_frame=\"head\"".to_string(),
            ));
        }
        if !st_fixed {
            log::warn!("st_fixed=false is untested, use with caution!");
        }
        if positions
            .iter()
            .any(|p| !p.pos_data().iter().chain([&p.t]).all(|v| v.is_finite()))
        {
            return Err(MaxwellError::InvalidPose("positions must be finite".to_string()));
        }
        if positions.windows(2).any(|w| w[1].t <= w[0].t) {
            return Err(MaxwellError::InvalidPose(
                "time points must be unique and in ascending order".to_string(),
            ));
        }
        let t_off = first_samp as f64 / sfreq;
        if let Some(first) = positions.first() {
            if first.t < t_off - TIME_SLACK {
                return Err(MaxwellError::InvalidPose(format!(
                    "head position time points must be greater than first sample offset, \
                     but found {:.4} < {:.4}",
                    first.t, t_off
                )));
            }
        }
        let max_dist = positions
            .iter()
            .map(|p| Vec3::from(p.trans).norm())
            .fold(0.0, f64::max);
        if max_dist > MAX_SANE_DISTANCE {
            log::warn!(
                "Found a distance greater than 1 m ({max_dist:.3} m) from the device origin, \
                 positions may be invalid and Maxwell filtering could fail"
            );
        }

        let mut samples: Vec<PoseSample> = positions
            .iter()
            .map(|p| PoseSample {
                // the slack may round to sample -1
                sample: (((p.t - t_off) * sfreq).round() as i64).max(0),
                trans: p.dev_head_t(),
                pos_data: p.pos_data(),
            })
            .collect();
        if let Some(w) = samples.windows(2).find(|w| w[1].sample <= w[0].sample) {
            return Err(MaxwellError::InvalidPose(format!(
                "two head positions fall on sample {}",
                w[1].sample
            )));
        }
        let n_inside = samples.partition_point(|p| p.sample < n_samples as i64);
        if n_inside < samples.len() {
            log::warn!(
                "Ignoring {} head position(s) after the end of the data ({:.3} s)",
                samples.len() - n_inside,
                t_off + n_samples as f64 / sfreq
            );
            samples.truncate(n_inside);
        }
        Ok(Self { samples })
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Segments of the buffer `[start, stop)`.
    ///
    /// A leading segment without a pose covers the samples before the first
    /// position inside the buffer; it reports `previous` on the position channels.
    pub fn plan(&self, start: usize, stop: usize, previous: Option<PosData>) -> Result<BufferPlan> {
        let (start_i, stop_i) = (start as i64, stop as i64);
        let lo = self.samples.partition_point(|p| p.sample < start_i);
        let hi = self.samples.partition_point(|p| p.sample < stop_i);
        let inside = &self.samples[lo..hi];

        let mut segments = Vec::with_capacity(inside.len() + 1);
        let lead_stop = inside.first().map_or(stop, |p| p.sample as usize) - start;
        if lead_stop > 0 {
            segments.push(Segment {
                trans: None,
                start: 0,
                stop: lead_stop,
                pos_data: previous,
            });
        }
        for (k, pose) in inside.iter().enumerate() {
            let seg_stop = inside.get(k + 1).map_or(stop, |next| next.sample as usize);
            segments.push(Segment {
                trans: Some(pose.trans.clone()),
                start: pose.sample as usize - start,
                stop: seg_stop - start,
                pos_data: Some(pose.pos_data),
            });
        }
        check_tiling(&segments, stop - start)?;

        let avg_trans = average_pose(&segments, stop - start);
        Ok(BufferPlan {
            segments,
            avg_trans,
        })
    }
}

/// Segments must be non-empty, contiguous and cover `[0, len)`.
pub fn check_tiling(segments: &[Segment], len: usize) -> Result<()> {
    let mut cursor = 0;
    for seg in segments {
        if seg.start != cursor || seg.is_empty() || seg.stop > len {
            return Err(MaxwellError::Tiling(format!(
                "segment [{}, {}) does not continue at sample {cursor} of {len}",
                seg.start, seg.stop
            )));
        }
        cursor = seg.stop;
    }
    if cursor != len {
        return Err(MaxwellError::Tiling(format!(
            "segments cover {cursor} of {len} samples"
        )));
    }
    Ok(())
}

fn average_pose(segments: &[Segment], len: usize) -> Option<Transform> {
    let mut acc = [0.0; 6];
    for seg in segments {
        let pos = seg.pos_data?;
        for (dst, v) in acc.iter_mut().zip(&pos[..6]) {
            *dst += v * seg.len() as f64;
        }
    }
    let acc = acc.map(|v| v / len as f64);
    Some(Transform::from_rotation_translation(
        CoordFrame::Meg,
        CoordFrame::Head,
        &quat_to_rot(&Vec3::new(acc[0], acc[1], acc[2])),
        &Vec3::new(acc[3], acc[4], acc[5]),
    ))
}
