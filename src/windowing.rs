//! Partition of a recording into processing buffers.

use crate::error::{MaxwellError, Result};

/// Buffer length used when no temporal projection is requested [s]
pub const DEFAULT_CHUNK_DURATION: f64 = 10.0;

/// Buffer boundaries `limits[0] = 0 < ... < limits[n] = n_samples`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Windows {
    pub limits: Vec<usize>,
    /// Nominal buffer length [samples]
    pub buffer_len: usize,
    /// The remainder was folded into the last buffer
    pub merged_tail: bool,
}

impl Windows {
    /// Fixed-length buffers; a shorter trailing remainder joins the previous buffer.
    pub fn new(n_samples: usize, buffer_len: usize) -> Result<Self> {
        if n_samples == 0 || buffer_len == 0 {
            return Err(MaxwellError::InvalidParameter(format!(
                "cannot split {n_samples} samples into buffers of {buffer_len}"
            )));
        }
        let buffer_len = buffer_len.min(n_samples);
        let mut limits: Vec<usize> = (0..=n_samples).step_by(buffer_len).collect();
        if limits.len() == 1 {
            limits.push(n_samples);
        }
        let mut merged_tail = false;
        if let Some(last) = limits.last_mut() {
            if *last != n_samples {
                *last = n_samples;
                merged_tail = true;
            }
        }
        Ok(Self {
            limits,
            buffer_len,
            merged_tail,
        })
    }

    /// Buffers of [`DEFAULT_CHUNK_DURATION`], used only to pace pose updates.
    pub fn default_chunks(n_samples: usize, sfreq: f64) -> Result<Self> {
        let len = ((DEFAULT_CHUNK_DURATION * sfreq).round() as usize).max(1);
        Self::new(n_samples, len)
    }

    pub fn len(&self) -> usize {
        self.limits.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(start, stop)` pairs in time order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.limits.windows(2).map(|w| (w[0], w[1]))
    }
}

/// Temporal buffer length in samples for `st_duration` seconds.
///
/// The duration must lie in `(0, duration + 1 / sfreq]`.
pub fn st_buffer_len(st_duration: f64, sfreq: f64, n_samples: usize) -> Result<usize> {
    let data_duration = n_samples.saturating_sub(1) as f64 / sfreq;
    if !(st_duration > 0.0 && st_duration <= data_duration + 1.0 / sfreq) {
        return Err(MaxwellError::InvalidParameter(format!(
            "st_duration ({st_duration:.1}s) must be between 0 and the duration of the data ({data_duration:.1}s)"
        )));
    }
    Ok(((st_duration * sfreq).round() as usize).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split() {
        let w = Windows::new(100, 25).unwrap();
        assert_eq!(w.limits, vec![0, 25, 50, 75, 100]);
        assert!(!w.merged_tail);
        assert_eq!(w.len(), 4);
    }

    #[test]
    fn test_tail_merged_into_previous() {
        let w = Windows::new(110, 25).unwrap();
        assert_eq!(w.limits, vec![0, 25, 50, 75, 110]);
        assert!(w.merged_tail);
    }

    #[test]
    fn test_short_recording_is_one_buffer() {
        let w = Windows::new(10, 25).unwrap();
        assert_eq!(w.limits, vec![0, 10]);
        assert_eq!(w.buffer_len, 10);
        assert_eq!(w.len(), 1);
        assert!(!w.is_empty());
    }

    #[test]
    fn test_partition_invariants() {
        for n in 1..200 {
            for len in [1, 3, 7, 16, 50, 199, 250] {
                let w = Windows::new(n, len).unwrap();
                assert_eq!(w.limits[0], 0);
                assert_eq!(*w.limits.last().unwrap(), n);
                let sizes: Vec<usize> = w.iter().map(|(a, b)| b - a).collect();
                assert_eq!(sizes.iter().sum::<usize>(), n);
                assert_eq!(w.len(), (n / len).max(1));
                let nominal = len.min(n);
                assert!(sizes.iter().all(|&s| s >= nominal && s < 2 * nominal));
            }
        }
    }

    #[test]
    fn test_default_chunks() {
        let w = Windows::default_chunks(4500, 200.0).unwrap();
        assert_eq!(w.buffer_len, 2000);
        assert_eq!(w.limits, vec![0, 2000, 4500]);
    }

    #[test]
    fn test_st_duration_bounds() {
        assert_eq!(st_buffer_len(1.0, 200.0, 1000).unwrap(), 200);
        assert_eq!(st_buffer_len(4.99, 200.0, 1000).unwrap(), 998);
        assert!(st_buffer_len(5.1, 200.0, 1000).is_err());
        assert!(st_buffer_len(0.0, 200.0, 1000).is_err());
    }
}
