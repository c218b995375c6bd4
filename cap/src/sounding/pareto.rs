//! Pareto frontier selection over (quality up, cost down)
//!
//! A candidate is dominated when another is at least as good on both axes
//! and strictly better on one. Selection policies pick from the frontier;
//! dominated candidates are logged but never win.

use crate::cascade::config::ParetoPolicy;

/// One scored sounding attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ParetoCandidate {
    /// Position in the evaluated result list
    pub index: usize,
    /// Quality score 0-100 as judged by the evaluator
    pub quality: f64,
    /// Dollar cost of the attempt
    pub cost: f64,
}

/// Split candidates into (frontier, dominated)
pub fn pareto_frontier(candidates: &[ParetoCandidate]) -> (Vec<ParetoCandidate>, Vec<ParetoCandidate>) {
    let mut frontier = Vec::new();
    let mut dominated = Vec::new();

    for candidate in candidates {
        let is_dominated = candidates.iter().any(|other| {
            other.index != candidate.index
                && other.quality >= candidate.quality
                && other.cost <= candidate.cost
                && (other.quality > candidate.quality || other.cost < candidate.cost)
        });
        if is_dominated {
            dominated.push(candidate.clone());
        } else {
            frontier.push(candidate.clone());
        }
    }
    (frontier, dominated)
}

/// Pick the winner from a non-empty frontier by policy
///
/// `balanced` first discards the low-quality half of the frontier (below
/// the median quality) so a throwaway-cheap attempt cannot win on ratio
/// alone, then maximizes quality per dollar. `interactive` is resolved by
/// the caller (it needs a checkpoint); here it falls back to balanced.
pub fn select_from_frontier(frontier: &[ParetoCandidate], policy: ParetoPolicy) -> Option<usize> {
    if frontier.is_empty() {
        return None;
    }
    let best = match policy {
        ParetoPolicy::PreferCheap => frontier
            .iter()
            .min_by(|a, b| a.cost.total_cmp(&b.cost).then(b.quality.total_cmp(&a.quality))),
        ParetoPolicy::PreferQuality => frontier
            .iter()
            .max_by(|a, b| a.quality.total_cmp(&b.quality).then(b.cost.total_cmp(&a.cost))),
        ParetoPolicy::Balanced | ParetoPolicy::Interactive => {
            let median = median_quality(frontier);
            frontier
                .iter()
                .filter(|c| c.quality >= median)
                .max_by(|a, b| {
                    let ratio_a = a.quality / a.cost.max(f64::EPSILON);
                    let ratio_b = b.quality / b.cost.max(f64::EPSILON);
                    ratio_a.total_cmp(&ratio_b)
                })
        }
    };
    best.map(|candidate| candidate.index)
}

fn median_quality(frontier: &[ParetoCandidate]) -> f64 {
    let mut qualities: Vec<f64> = frontier.iter().map(|c| c.quality).collect();
    qualities.sort_by(f64::total_cmp);
    let n = qualities.len();
    if n % 2 == 1 {
        qualities[n / 2]
    } else {
        (qualities[n / 2 - 1] + qualities[n / 2]) / 2.0
    }
}
