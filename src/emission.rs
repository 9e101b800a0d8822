// =============================================================================
// Emission Strategies — fixed-point reward distribution
// =============================================================================
//
// Both strategies end the same way: percentages are converted to fixed-point
// shares of M = 1_000_000_000 and the rounding residual is absorbed by index
// 0, so the cruncher rewards always sum to exactly M.
//
// Tier default: rank 1 owns a 35% tier, ranks 2–5 share a 40% tier, ranks
// 6–10 share a 25% tier; each tier's budget is split equally across its
// present members and empty tiers re-normalize away.
//
// Contribution-weighted: composite of min-max-normalized rank, ensemble
// contribution and diversity (1 − model_correlation), floored at `min_pct`.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::contract::EmissionStrategy;
use crate::types::{
    pct_to_frac64, CruncherReward, EmissionCheckpoint, JsonMap, ProviderReward, FRAC_64_MULTIPLIER,
};

/// One ranked model inside a checkpoint aggregation. `cruncher_index` in the
/// emission payload is the entry's position in this ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedEntry {
    pub model_id: String,
    pub model_name: Option<String>,
    pub cruncher_name: Option<String>,
    pub rank: u32,
    pub prediction_count: u64,
    pub snapshot_count: u64,
    pub result_summary: JsonMap,
}

/// Build the emission payload for the configured strategy.
pub fn build_emission(
    strategy: &EmissionStrategy,
    ranked_entries: &[RankedEntry],
    crunch_pubkey: &str,
    compute_provider: Option<&str>,
    data_provider: Option<&str>,
) -> EmissionCheckpoint {
    match strategy {
        EmissionStrategy::TierDefault => {
            tier_default_emission(ranked_entries, crunch_pubkey, compute_provider, data_provider)
        }
        EmissionStrategy::ContributionWeighted {
            rank_weight,
            contribution_weight,
            diversity_weight,
            min_pct,
        } => contribution_weighted_emission(
            ranked_entries,
            crunch_pubkey,
            compute_provider,
            data_provider,
            *rank_weight,
            *contribution_weight,
            *diversity_weight,
            *min_pct,
        ),
    }
}

// =============================================================================
// Tier default
// =============================================================================

/// (inclusive rank range, tier budget in percent)
const TIERS: &[(u32, u32, f64)] = &[(1, 1, 35.0), (2, 5, 40.0), (6, 10, 25.0)];

pub fn tier_default_emission(
    ranked_entries: &[RankedEntry],
    crunch_pubkey: &str,
    compute_provider: Option<&str>,
    data_provider: Option<&str>,
) -> EmissionCheckpoint {
    if ranked_entries.is_empty() {
        return empty_emission(crunch_pubkey, compute_provider, data_provider);
    }

    let mut raw_pcts = Vec::with_capacity(ranked_entries.len());
    for entry in ranked_entries {
        let pct = TIERS
            .iter()
            .find(|(lo, hi, _)| entry.rank >= *lo && entry.rank <= *hi)
            .map(|(lo, hi, budget)| {
                let present = ranked_entries
                    .iter()
                    .filter(|e| e.rank >= *lo && e.rank <= *hi)
                    .count();
                budget / present.max(1) as f64
            })
            .unwrap_or(0.0);
        raw_pcts.push(pct);
    }

    finalize(
        raw_pcts,
        ranked_entries.len(),
        crunch_pubkey,
        compute_provider,
        data_provider,
    )
}

// =============================================================================
// Contribution-weighted
// =============================================================================

#[allow(clippy::too_many_arguments)]
pub fn contribution_weighted_emission(
    ranked_entries: &[RankedEntry],
    crunch_pubkey: &str,
    compute_provider: Option<&str>,
    data_provider: Option<&str>,
    rank_weight: f64,
    contribution_weight: f64,
    diversity_weight: f64,
    min_pct: f64,
) -> EmissionCheckpoint {
    if ranked_entries.is_empty() {
        return empty_emission(crunch_pubkey, compute_provider, data_provider);
    }

    let n = ranked_entries.len();
    let summary_f64 = |entry: &RankedEntry, key: &str| {
        entry
            .result_summary
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    };

    // Min-max normalize each component to [0, 1].
    let normalize = |values: Vec<f64>| -> Vec<f64> {
        let mn = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let mx = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if mx - mn < 1e-12 {
            return vec![1.0 / n as f64; n];
        }
        values.into_iter().map(|v| (v - mn) / (mx - mn)).collect()
    };

    let rank_scores = normalize(
        ranked_entries
            .iter()
            .map(|e| 1.0 / e.rank.max(1) as f64)
            .collect(),
    );
    let contribution_scores =
        normalize(ranked_entries.iter().map(|e| summary_f64(e, "contribution")).collect());
    let diversity_scores = normalize(
        ranked_entries
            .iter()
            .map(|e| 1.0 - summary_f64(e, "model_correlation"))
            .collect(),
    );

    let composite: Vec<f64> = (0..n)
        .map(|i| {
            rank_weight * rank_scores[i]
                + contribution_weight * contribution_scores[i]
                + diversity_weight * diversity_scores[i]
        })
        .collect();

    let total: f64 = composite.iter().sum();
    let raw_pcts: Vec<f64> = if total < 1e-12 {
        vec![100.0 / n as f64; n]
    } else {
        composite
            .iter()
            .map(|c| (c / total * 100.0).max(min_pct))
            .collect()
    };

    finalize(raw_pcts, n, crunch_pubkey, compute_provider, data_provider)
}

// =============================================================================
// Shared tail: normalize → fixed-point → residual into index 0
// =============================================================================

fn finalize(
    raw_pcts: Vec<f64>,
    n: usize,
    crunch_pubkey: &str,
    compute_provider: Option<&str>,
    data_provider: Option<&str>,
) -> EmissionCheckpoint {
    let pct_sum: f64 = raw_pcts.iter().sum();
    let pcts: Vec<f64> = if pct_sum < 1e-12 {
        vec![100.0 / n as f64; n]
    } else {
        raw_pcts.iter().map(|p| p / pct_sum * 100.0).collect()
    };

    let mut frac64: Vec<i64> = pcts.iter().map(|p| pct_to_frac64(*p)).collect();
    let diff = FRAC_64_MULTIPLIER - frac64.iter().sum::<i64>();
    if let Some(first) = frac64.first_mut() {
        *first += diff;
    }

    EmissionCheckpoint {
        crunch: crunch_pubkey.to_string(),
        cruncher_rewards: frac64
            .into_iter()
            .enumerate()
            .map(|(cruncher_index, reward_pct)| CruncherReward {
                cruncher_index,
                reward_pct,
            })
            .collect(),
        compute_provider_rewards: provider_rewards(compute_provider),
        data_provider_rewards: provider_rewards(data_provider),
    }
}

fn provider_rewards(provider: Option<&str>) -> Vec<ProviderReward> {
    provider
        .map(|p| {
            vec![ProviderReward {
                provider: p.to_string(),
                reward_pct: FRAC_64_MULTIPLIER,
            }]
        })
        .unwrap_or_default()
}

fn empty_emission(
    crunch_pubkey: &str,
    compute_provider: Option<&str>,
    data_provider: Option<&str>,
) -> EmissionCheckpoint {
    EmissionCheckpoint {
        crunch: crunch_pubkey.to_string(),
        cruncher_rewards: Vec::new(),
        compute_provider_rewards: provider_rewards(compute_provider),
        data_provider_rewards: provider_rewards(data_provider),
    }
}

// =============================================================================
// Tests
// =============================================================================
