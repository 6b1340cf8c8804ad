//! Recording and measurement-info model consumed and produced by the filter.
//!
//! Loading vendor files is someone else's job; this is the boundary format
//! (serde-friendly, so the CLI can read and write it as JSON).

use std::collections::HashSet;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{MaxwellError, Result};
use crate::geometry::CoilType;
use crate::types::{CoordFrame, Transform, LOC_LEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Meg,
    RefMeg,
    Eeg,
    Stim,
    Misc,
    /// Head position result channel
    Chpi,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub kind: ChannelKind,
    pub coil_type: CoilType,
    /// Position followed by the ex, ey, ez coil axes, device frame
    pub loc: [f64; LOC_LEN],
}

impl ChannelInfo {
    pub fn is_meg(&self, include_ref: bool) -> bool {
        match self.kind {
            ChannelKind::Meg => true,
            ChannelKind::RefMeg => include_ref,
            _ => false,
        }
    }
}

/// Signal-space projector attached to the recording
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Projector {
    pub desc: String,
    pub active: bool,
    pub col_names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SssInfo {
    pub in_order: usize,
    pub out_order: usize,
    pub nchan: usize,
    pub origin: [f32; 3],
    pub job: i32,
    pub nfree: usize,
    pub frame: CoordFrame,
    pub components: Vec<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaxSt {
    pub job: i32,
    pub subspcorr: f64,
    /// Buffer length [s]
    pub buflen: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SssCal {
    /// Per channel: [grad flag / mag cal, imbalance, loc...]
    pub cal_corrs: Vec<Vec<f64>>,
    pub cal_chans: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SssCtc {
    pub proj_items_chs: Vec<String>,
    /// Stored transposed, row-major
    pub decoupler: Vec<Vec<f64>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MaxInfo {
    pub sss_info: Option<SssInfo>,
    pub max_st: Option<MaxSt>,
    pub sss_cal: Option<SssCal>,
    pub sss_ctc: Option<SssCtc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub block_id: String,
    pub creator: String,
    pub date: String,
    pub experimenter: String,
    pub max_info: MaxInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasInfo {
    /// Sampling rate [Hz]
    pub sfreq: f64,
    pub channels: Vec<ChannelInfo>,
    #[serde(default)]
    pub bads: Vec<String>,
    #[serde(default)]
    pub dev_head_t: Option<Transform>,
    #[serde(default)]
    pub projs: Vec<Projector>,
    /// CTF-style software compensation grade currently applied
    #[serde(default)]
    pub comp_grade: u32,
    /// Digitised head points, head frame [m]
    #[serde(default)]
    pub dig: Vec<[f64; 3]>,
    #[serde(default)]
    pub proc_history: Vec<ProcessingRecord>,
}

impl MeasInfo {
    pub fn ch_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn is_bad(&self, name: &str) -> bool {
        self.bads.iter().any(|b| b == name)
    }

    /// Indices of MEG channels (optionally with reference MEG channels).
    pub fn meg_picks(&self, include_ref: bool) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.is_meg(include_ref))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn has_active_projectors(&self) -> bool {
        self.projs.iter().any(|p| p.active)
    }

    /// Drop projectors that touch any MEG channel.
    pub fn without_meg_projectors(&self) -> Vec<Projector> {
        let meg: HashSet<&str> = self
            .channels
            .iter()
            .filter(|ch| ch.is_meg(false))
            .map(|ch| ch.name.as_str())
            .collect();
        self.projs
            .iter()
            .filter(|p| !p.col_names.iter().any(|c| meg.contains(c.as_str())))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub info: MeasInfo,
    /// Samples, shape (n_channels, n_samples)
    pub data: Array2<f64>,
    /// Index of the first sample relative to acquisition start
    #[serde(default)]
    pub first_samp: usize,
}

impl Recording {
    pub fn new(info: MeasInfo, data: Array2<f64>, first_samp: usize) -> Result<Self> {
        let raw = Self {
            info,
            data,
            first_samp,
        };
        raw.check_consistency()?;
        Ok(raw)
    }

    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    pub fn check_consistency(&self) -> Result<()> {
        if !(self.info.sfreq.is_finite() && self.info.sfreq > 0.0) {
            return Err(MaxwellError::InvalidRecording(format!(
                "sampling rate must be positive, got {}",
                self.info.sfreq
            )));
        }
        if self.data.nrows() != self.info.n_channels() {
            return Err(MaxwellError::InvalidRecording(format!(
                "data has {} rows but info describes {} channels",
                self.data.nrows(),
                self.info.n_channels()
            )));
        }
        if self.n_samples() == 0 {
            return Err(MaxwellError::InvalidRecording(
                "recording has no samples".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::synthetic_info;

    #[test]
    fn test_shape_mismatch_rejected() {
        let info = synthetic_info(2, None);
        let data = Array2::zeros((5, 10));
        assert!(matches!(
            Recording::new(info, data, 0),
            Err(MaxwellError::InvalidRecording(_))
        ));
    }

    #[test]
    fn test_meg_picks_and_projectors() {
        let mut info = synthetic_info(2, None);
        info.channels.push(ChannelInfo {
            name: "STI101".to_string(),
            kind: ChannelKind::Stim,
            coil_type: CoilType::None,
            loc: [0.0; LOC_LEN],
        });
        info.projs = vec![
            Projector {
                desc: "meg".to_string(),
                active: false,
                col_names: vec![info.channels[0].name.clone()],
            },
            Projector {
                desc: "other".to_string(),
                active: false,
                col_names: vec!["STI101".to_string()],
            },
        ];
        assert_eq!(info.meg_picks(true), (0..6).collect::<Vec<_>>());
        assert!(!info.has_active_projectors());
        let kept = info.without_meg_projectors();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].desc, "other");
    }

    #[test]
    fn test_recording_json_round_trip() {
        let info = synthetic_info(1, None);
        let raw = Recording::new(info, Array2::zeros((3, 4)), 7).unwrap();
        let text = serde_json::to_string(&raw).unwrap();
        let back: Recording = serde_json::from_str(&text).unwrap();
        assert_eq!(back, raw);
    }
}
