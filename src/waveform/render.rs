//! Bars drawn for a track at a given width.
//!
//! Real waveform data and the decorative placeholder shown while none exists
//! are kept in separate variants so nothing mistakes one for the other.

use std::f32::consts::PI;

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    domain::waveform::WaveformRecord,
    waveform::decimate::{clamp_unit, sample},
};

#[derive(Debug, Clone, PartialEq)]
pub enum RenderedWaveform {
    Extracted { bars: Vec<f32> },
    /// Synthetic envelope, not derived from any audio.
    Placeholder { bars: Vec<f32> },
}

impl RenderedWaveform {
    pub fn bars(&self) -> &[f32] {
        match self {
            RenderedWaveform::Extracted { bars } | RenderedWaveform::Placeholder { bars } => bars,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, RenderedWaveform::Placeholder { .. })
    }
}

/// Resamples the stored record to `bar_count` bars, or falls back to a
/// placeholder seeded by `seed` when there is no record.
///
/// The simplified peaks are used whenever they have enough points.
pub fn render_bars(record: Option<&WaveformRecord>, bar_count: usize, seed: u64) -> RenderedWaveform {
    let Some(record) = record else {
        return RenderedWaveform::Placeholder {
            bars: placeholder_peaks(seed, bar_count),
        };
    };

    let source = if record.simplified.len() >= bar_count {
        &record.simplified
    } else {
        &record.full
    };

    RenderedWaveform::Extracted {
        bars: sample(source, bar_count).into_iter().map(clamp_unit).collect(),
    }
}

/// Deterministic decorative envelope: a slow swell with per-bar jitter.
pub fn placeholder_peaks(seed: u64, count: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let phase = rng.random_range(0.0..PI);

    (0..count)
        .map(|i| {
            let t = i as f32 / count.max(1) as f32;
            let swell = 0.45 + 0.25 * (t * 3.0 * PI + phase).sin();
            clamp_unit(swell * rng.random_range(0.55f32..1.0))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> WaveformRecord {
        WaveformRecord {
            full: vec![0.1, 0.2, 0.9, 0.4, 0.3, 0.2, 0.1, 0.6],
            simplified: vec![0.9, 0.6],
            sample_rate: 4,
        }
    }

    #[test]
    fn test_uses_simplified_when_dense_enough() {
        let rendered = render_bars(Some(&record()), 2, 7);

        assert!(!rendered.is_placeholder());
        assert_eq!(rendered.bars(), &[0.9, 0.6]);
    }

    #[test]
    fn test_uses_full_for_wide_renders() {
        let rendered = render_bars(Some(&record()), 4, 7);

        assert_eq!(rendered.bars(), &[0.2, 0.9, 0.3, 0.6]);
    }

    #[test]
    fn test_out_of_range_peaks_are_clamped() {
        let odd = WaveformRecord {
            full: vec![1.5, -0.5],
            simplified: vec![1.5, -0.5],
            sample_rate: 1,
        };

        assert_eq!(render_bars(Some(&odd), 2, 0).bars(), &[1.0, 0.0]);
    }

    #[test]
    fn test_placeholder_is_deterministic_and_marked() {
        let a = render_bars(None, 64, 99);
        let b = render_bars(None, 64, 99);
        let other = render_bars(None, 64, 100);

        assert!(a.is_placeholder());
        assert_eq!(a, b);
        assert_ne!(a, other);
        assert_eq!(a.bars().len(), 64);
        assert!(a.bars().iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_zero_width_renders_nothing() {
        assert!(render_bars(Some(&record()), 0, 1).bars().is_empty());
        assert!(render_bars(None, 0, 1).bars().is_empty());
    }
}
