use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::AppError;

pub const DEFAULT_DRAWS: usize = 1_000_000;
pub const DEFAULT_LIMIT: f64 = 95.0;

/// Normalized posterior share for one K within one evidence category.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedEntry {
    pub norm_mean: f64,
    pub lower_limit: f64,
    pub upper_limit: f64,
}

/// Monte-Carlo normalization of per-K log-evidence estimates.
///
/// Ported from the thermodynamic integration normalization in MavericK:
/// draw from Normal(mean, SE) in log space for each K independently,
/// exponentiate, and within each trial divide each K's sample by the
/// across-K total, giving a distribution of "this K's share of total
/// evidence". The per-K draws are deliberately independent rather than
/// jointly modeled; that is the reference behavior and is preserved.
///
/// `limit` is the two-sided confidence level in percent (95 gives the
/// 2.5th/97.5th percentiles).
pub fn normalize_evidence(
    means: &[f64],
    sds: &[f64],
    k_list: &[u32],
    draws: usize,
    limit: f64,
    seed: Option<u64>,
) -> Result<Vec<(u32, NormalizedEntry)>, AppError> {
    match seed {
        Some(seed) => {
            let mut rng = StdRng::seed_from_u64(seed);
            normalize_evidence_with_rng(means, sds, k_list, draws, limit, &mut rng)
        }
        None => {
            let mut rng = rand::thread_rng();
            normalize_evidence_with_rng(means, sds, k_list, draws, limit, &mut rng)
        }
    }
}

/// Same as [`normalize_evidence`] with an injected random source, so the
/// engine can be driven deterministically.
pub fn normalize_evidence_with_rng<R: Rng>(
    means: &[f64],
    sds: &[f64],
    k_list: &[u32],
    draws: usize,
    limit: f64,
    rng: &mut R,
) -> Result<Vec<(u32, NormalizedEntry)>, AppError> {
    let n_k = k_list.len();
    if means.len() != n_k || sds.len() != n_k {
        return Err(AppError::SchemaMismatch {
            file: "evidence table".to_string(),
            detail: format!(
                "{} mean / {} SE entries for {} K values",
                means.len(),
                sds.len(),
                n_k
            ),
        });
    }

    // Subtract the maximum mean before exponentiating. Shares are invariant
    // under a common shift in log space, and without it realistic
    // log-evidence magnitudes under/overflow exp().
    let max_mean = means.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let mut z_array: Vec<Vec<f64>> = Vec::with_capacity(n_k);
    for i in 0..n_k {
        let normal =
            Normal::new(means[i] - max_mean, sds[i]).map_err(|_| AppError::EvidenceParse {
                column: "logEvidence SE".to_string(),
                value: format!("{}", sds[i]),
            })?;
        let samples: Vec<f64> = (0..draws).map(|_| normal.sample(&mut *rng).exp()).collect();
        z_array.push(samples);
    }

    // Per trial, each K's sample becomes its share of that trial's total.
    for t in 0..draws {
        let total: f64 = z_array.iter().map(|samples| samples[t]).sum();
        if total > 0.0 {
            for samples in z_array.iter_mut() {
                samples[t] /= total;
            }
        }
    }

    let l_limit = (100.0 - limit) / 2.0;
    let u_limit = 100.0 - l_limit;

    let mut result = Vec::with_capacity(n_k);
    for (i, &k) in k_list.iter().enumerate() {
        let mut shares = std::mem::take(&mut z_array[i]);
        shares.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let norm_mean = shares.iter().sum::<f64>() / shares.len() as f64;
        result.push((
            k,
            NormalizedEntry {
                norm_mean,
                lower_limit: percentile(&shares, l_limit),
                upper_limit: percentile(&shares, u_limit),
            },
        ));
    }

    Ok(result)
}

/// Percentile over an ascending-sorted slice, linearly interpolating
/// between closest ranks (numpy's default convention).
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates_between_ranks() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert!((percentile(&sorted, 0.0) - 1.0).abs() < 1e-12);
        assert!((percentile(&sorted, 100.0) - 10.0).abs() < 1e-12);
        // rank 4.5 -> halfway between 5.0 and 6.0
        assert!((percentile(&sorted, 50.0) - 5.5).abs() < 1e-12);
        // rank 0.225 -> between 1.0 and 2.0
        assert!((percentile(&sorted, 2.5) - 1.225).abs() < 1e-12);
    }

    #[test]
    fn shares_are_bounded_and_sum_to_one() {
        let means = vec![-1240.0, -1232.0, -1235.0];
        let sds = vec![1.5, 2.0, 1.0];
        let k_list = vec![1, 2, 3];

        let result =
            normalize_evidence(&means, &sds, &k_list, 1000, DEFAULT_LIMIT, Some(42)).unwrap();
        assert_eq!(result.len(), 3);

        let mut sum = 0.0;
        for (_, entry) in &result {
            assert!(entry.lower_limit >= 0.0);
            assert!(entry.lower_limit <= entry.norm_mean);
            assert!(entry.norm_mean <= entry.upper_limit);
            assert!(entry.upper_limit <= 1.0);
            sum += entry.norm_mean;
        }
        assert!((sum - 1.0).abs() < 0.01, "posterior means sum to {}", sum);
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let means = vec![-100.0, -98.5, -99.2];
        let sds = vec![0.8, 0.8, 0.8];
        let k_list = vec![2, 3, 4];

        let a = normalize_evidence(&means, &sds, &k_list, 1000, DEFAULT_LIMIT, Some(7)).unwrap();
        let b = normalize_evidence(&means, &sds, &k_list, 1000, DEFAULT_LIMIT, Some(7)).unwrap();
        for ((ka, ea), (kb, eb)) in a.iter().zip(b.iter()) {
            assert_eq!(ka, kb);
            assert_eq!(ea.norm_mean.to_bits(), eb.norm_mean.to_bits());
            assert_eq!(ea.lower_limit.to_bits(), eb.lower_limit.to_bits());
            assert_eq!(ea.upper_limit.to_bits(), eb.upper_limit.to_bits());
        }
    }

    #[test]
    fn clearly_best_k_dominates() {
        // K=2 sits 20 log units above the rest; its share should be ~1.
        let means = vec![-520.0, -500.0, -521.0];
        let sds = vec![1.0, 1.0, 1.0];
        let k_list = vec![1, 2, 3];

        let result =
            normalize_evidence(&means, &sds, &k_list, 1000, DEFAULT_LIMIT, Some(11)).unwrap();
        let best = result.iter().find(|(k, _)| *k == 2).unwrap().1;
        assert!(best.norm_mean > 0.99);
    }

    #[test]
    fn independent_categories_each_sum_to_one() {
        let k_list = vec![1, 2, 3];
        let categories = vec![
            (vec![-300.0, -298.0, -299.0], vec![1.0, 1.2, 0.9]),
            (vec![-410.0, -411.5, -409.0], vec![2.0, 2.0, 2.0]),
        ];

        for (means, sds) in categories {
            let result =
                normalize_evidence(&means, &sds, &k_list, 1000, DEFAULT_LIMIT, Some(3)).unwrap();
            assert_eq!(result.len(), 3);
            let sum: f64 = result.iter().map(|(_, e)| e.norm_mean).sum();
            assert!((sum - 1.0).abs() < 0.01);
        }
    }

    #[test]
    fn negative_standard_error_is_rejected() {
        let err = normalize_evidence(&[-10.0], &[-1.0], &[1], 100, DEFAULT_LIMIT, Some(1))
            .unwrap_err();
        assert!(matches!(err, AppError::EvidenceParse { .. }));
    }
}
