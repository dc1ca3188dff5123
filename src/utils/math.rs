use rayon::slice::ParallelSliceMut;

/// Median of a float slice. Signal data is finite, so NaN handling is not attempted.
pub fn median(data: &[f32]) -> Option<f32> {
    if data.is_empty() {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.par_sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median and median absolute deviation of a signal.
pub fn med_mad(data: &[f32]) -> Option<(f32, f32)> {
    let med = median(data)?;
    let deviations: Vec<f32> = data.iter().map(|x| (x - med).abs()).collect();
    let mad = median(&deviations)?;
    Some((med, mad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn test_median_empty() {
        let data: [f32; 0] = [];
        assert_eq!(median(&data), None);
    }

    #[test]
    fn test_median_odd_count() {
        let data = [3.0, 1.0, 4.0, 1.0, 5.0];
        assert_eq!(median(&data), Some(3.0));
    }

    #[test]
    fn test_median_even_count() {
        let data = [3.0, 1.0, 4.0, 2.0];
        assert_eq!(median(&data), Some(2.5));
    }

    #[test]
    fn test_median_single_element() {
        assert_eq!(median(&[7.0]), Some(7.0));
    }

    #[test]
    fn test_med_mad() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0];
        let (med, mad) = med_mad(&data).unwrap();
        assert_eq!(med, 3.0);
        assert_eq!(mad, 1.0);
    }

    #[test]
    fn test_med_mad_constant_signal() {
        let data = [2.0; 10];
        let (med, mad) = med_mad(&data).unwrap();
        assert_eq!(med, 2.0);
        assert_eq!(mad, 0.0);
    }

    #[test]
    fn test_median_is_order_independent() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut data: Vec<f32> = (0..1001).map(|i| i as f32).collect();
        data.shuffle(&mut rng);
        assert_eq!(median(&data), Some(500.0));

        let mut data_even: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        data_even.shuffle(&mut rng);
        assert_eq!(median(&data_even), Some(499.5));
    }

    #[test]
    fn test_med_mad_shuffled_matches_sorted() {
        let mut rng = StdRng::seed_from_u64(42);
        let sorted: Vec<f32> = (0..501).map(|i| i as f32).collect();
        let mut shuffled = sorted.clone();
        shuffled.shuffle(&mut rng);
        assert_eq!(med_mad(&sorted), med_mad(&shuffled));
    }
}
