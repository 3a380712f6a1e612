//! Max-per-bucket decimation of peak sequences.
//!
//! Averaging would flatten short transients at low resolution, so every
//! output bucket reports the tallest peak it covers.

/// Storage-time reduction of `peaks` to exactly `target_count` points.
///
/// Returns the input unchanged when it already has `target_count` points.
pub fn simplify(peaks: &[f32], target_count: usize) -> Vec<f32> {
    if peaks.len() == target_count {
        return peaks.to_vec();
    }
    max_per_bucket(peaks, target_count)
}

/// Render-time reduction of `peaks` to `bar_count` bars.
///
/// Same windowing as [`simplify`]; `bar_count` follows the available width.
pub fn sample(peaks: &[f32], bar_count: usize) -> Vec<f32> {
    max_per_bucket(peaks, bar_count)
}

/// Bucket `i` spans `[floor(i*len/n), floor((i+1)*len/n))`; empty buckets are 0.
fn max_per_bucket(peaks: &[f32], buckets: usize) -> Vec<f32> {
    if buckets == 0 {
        return Vec::new();
    }

    let len = peaks.len();
    (0..buckets)
        .map(|i| {
            let start = i * len / buckets;
            let end = (i + 1) * len / buckets;
            peaks[start..end].iter().copied().fold(0.0f32, f32::max)
        })
        .collect()
}

/// Clamp a peak into `[0, 1]`, mapping NaN to 0.
pub fn clamp_unit(peak: f32) -> f32 {
    if peak.is_nan() { 0.0 } else { peak.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn random_peaks(rng: &mut StdRng) -> Vec<f32> {
        let len = rng.random_range(0..600);
        (0..len).map(|_| rng.random_range(0.0f32..=1.0)).collect()
    }

    #[test]
    fn test_simplify_pairs() {
        assert_eq!(simplify(&[0.1, 0.9, 0.3, 0.2], 2), vec![0.9, 0.3]);
    }

    #[test]
    fn test_zero_target_is_empty() {
        assert!(simplify(&[0.5, 0.7], 0).is_empty());
        assert!(sample(&[0.5, 0.7], 0).is_empty());
        assert!(simplify(&[], 0).is_empty());
    }

    #[test]
    fn test_short_input_pads_with_empty_buckets() {
        assert_eq!(simplify(&[0.4, 0.8], 4), vec![0.0, 0.4, 0.0, 0.8]);
        assert_eq!(sample(&[], 3), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_transient_survives_decimation() {
        let mut peaks = vec![0.05; 1000];
        peaks[517] = 0.95;

        let bars = sample(&peaks, 10);

        assert_eq!(bars[5], 0.95);
        assert!(bars.iter().enumerate().all(|(i, &b)| i == 5 || b == 0.05));
    }

    #[test]
    fn test_length_identity_and_range_hold_for_random_input() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..300 {
            let peaks = random_peaks(&mut rng);
            let target = rng.random_range(0..400);

            let simplified = simplify(&peaks, target);
            assert_eq!(simplified.len(), target);
            assert!(simplified.iter().all(|p| (0.0..=1.0).contains(p)));

            assert_eq!(simplify(&peaks, peaks.len()), peaks);
            assert_eq!(sample(&peaks, peaks.len()), peaks);
        }
    }

    #[test]
    fn test_buckets_report_true_window_maximum() {
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..300 {
            let peaks = random_peaks(&mut rng);
            let target = rng.random_range(1..200);
            let simplified = simplify(&peaks, target);
            let len = peaks.len();

            if len == target {
                continue;
            }
            for (i, value) in simplified.iter().enumerate() {
                let window = &peaks[i * len / target..(i + 1) * len / target];
                let expected = window.iter().copied().fold(0.0f32, f32::max);
                assert_eq!(*value, expected);
                // never invents a peak absent from its window
                assert!(window.is_empty() || window.contains(value));
            }
        }
    }

    #[test]
    fn test_clamp_unit() {
        assert_eq!(clamp_unit(1.7), 1.0);
        assert_eq!(clamp_unit(-0.2), 0.0);
        assert_eq!(clamp_unit(f32::NAN), 0.0);
        assert_eq!(clamp_unit(0.3), 0.3);
    }
}
