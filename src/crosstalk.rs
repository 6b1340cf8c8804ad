//! Cross-talk decoupling matrix keyed by channel name.

use std::collections::{HashMap, HashSet};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{MaxwellError, Result};
use crate::recording::{MeasInfo, SssCtc};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossTalk {
    /// Channel names indexing both axes of `decoupler`
    pub proj_items_chs: Vec<String>,
    /// Square decoupling matrix, row-major
    pub decoupler: Vec<Vec<f64>>,
}

fn clean_name(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).collect()
}

impl CrossTalk {
    pub fn new(proj_items_chs: Vec<String>, decoupler: Vec<Vec<f64>>) -> Result<Self> {
        let ctc = Self {
            proj_items_chs,
            decoupler,
        };
        ctc.check_shape()?;
        Ok(ctc)
    }

    pub fn check_shape(&self) -> Result<()> {
        let n = self.proj_items_chs.len();
        if self.decoupler.len() != n || self.decoupler.iter().any(|row| row.len() != n) {
            return Err(MaxwellError::CrossTalk(format!(
                "decoupler must be {n} x {n} to match its channel list"
            )));
        }
        Ok(())
    }

    /// Decoupler restricted to `picks` (channel indices into `info`), in that order.
    ///
    /// Every MEG channel of `meg_picks` must be present; extra channels in the
    /// matrix are only warned about.
    pub fn restricted(&self, info: &MeasInfo, meg_picks: &[usize], picks: &[usize]) -> Result<DMatrix<f64>> {
        self.check_shape()?;
        let meg_names: Vec<&str> = meg_picks.iter().map(|&p| info.channels[p].name.as_str()).collect();
        // older files pad names with spaces
        let ctc_chs: Vec<String> = match meg_names.first() {
            Some(first) if !self.proj_items_chs.iter().any(|c| c == first) => {
                self.proj_items_chs.iter().map(|c| clean_name(c)).collect()
            }
            _ => self.proj_items_chs.clone(),
        };
        let index: HashMap<&str, usize> = ctc_chs
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx))
            .collect();

        let mut missing: Vec<&str> = meg_names
            .iter()
            .copied()
            .filter(|name| !index.contains_key(name))
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(MaxwellError::CrossTalk(format!(
                "missing MEG channels in cross-talk matrix: {missing:?}"
            )));
        }
        let meg_set: HashSet<&str> = meg_names.iter().copied().collect();
        let mut extra: Vec<&str> = ctc_chs
            .iter()
            .map(String::as_str)
            .filter(|name| !meg_set.contains(name))
            .collect();
        if !extra.is_empty() {
            extra.sort_unstable();
            log::warn!("Not all cross-talk channels in raw: {extra:?}");
        }

        let ctc_picks = picks
            .iter()
            .map(|&p| {
                index.get(info.channels[p].name.as_str()).copied().ok_or_else(|| {
                    MaxwellError::CrossTalk(format!(
                        "channel {} not in cross-talk matrix",
                        info.channels[p].name
                    ))
                })
            })
            .collect::<Result<Vec<usize>>>()?;
        Ok(DMatrix::from_fn(ctc_picks.len(), ctc_picks.len(), |r, c| {
            self.decoupler[ctc_picks[r]][ctc_picks[c]]
        }))
    }

    /// Provenance record; the decoupler is stored transposed.
    pub fn history_record(&self) -> SssCtc {
        let n = self.proj_items_chs.len();
        SssCtc {
            proj_items_chs: self.proj_items_chs.clone(),
            decoupler: (0..n)
                .map(|r| (0..n).map(|c| self.decoupler[c][r]).collect())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::synthetic_info;

    fn reversed_ctc(info: &MeasInfo) -> CrossTalk {
        // channel order reversed relative to the recording, value encodes (row, col)
        let names: Vec<String> = info.channels.iter().rev().map(|c| c.name.clone()).collect();
        let n = names.len();
        let decoupler = (0..n)
            .map(|r| (0..n).map(|c| (r * 100 + c) as f64).collect())
            .collect();
        CrossTalk::new(names, decoupler).unwrap()
    }

    #[test]
    fn test_restricted_follows_pick_order() {
        let info = synthetic_info(2, None);
        let ctc = reversed_ctc(&info);
        let meg = info.meg_picks(false);
        let mat = ctc.restricted(&info, &meg, &[0, 2]).unwrap();
        // recording channel 0 is row 5 of the file, channel 2 is row 3
        assert_eq!(mat.shape(), (2, 2));
        assert_eq!(mat[(0, 0)], 505.0);
        assert_eq!(mat[(0, 1)], 503.0);
        assert_eq!(mat[(1, 0)], 305.0);
    }

    #[test]
    fn test_padded_names_are_cleaned() {
        let info = synthetic_info(1, None);
        let mut ctc = reversed_ctc(&info);
        for name in ctc.proj_items_chs.iter_mut() {
            *name = name.replace("MEG", "MEG ");
        }
        let meg = info.meg_picks(false);
        assert!(ctc.restricted(&info, &meg, &meg).is_ok());
    }

    #[test]
    fn test_missing_channel_is_fatal() {
        let info = synthetic_info(2, None);
        let mut ctc = reversed_ctc(&info);
        ctc.proj_items_chs[0] = "MEG9999".to_string();
        let meg = info.meg_picks(false);
        assert!(matches!(
            ctc.restricted(&info, &meg, &meg),
            Err(MaxwellError::CrossTalk(_))
        ));
    }

    #[test]
    fn test_shape_checked() {
        let err = CrossTalk::new(vec!["A".into(), "B".into()], vec![vec![1.0, 0.0]]);
        assert!(matches!(err, Err(MaxwellError::CrossTalk(_))));
    }

    #[test]
    fn test_history_is_transposed() {
        let ctc = CrossTalk::new(
            vec!["A".into(), "B".into()],
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
        )
        .unwrap();
        assert_eq!(ctc.history_record().decoupler, vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
    }
}
