//! Temperature ladders and the state exchange rule of Metropolis-coupled chains.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The ladder `1 / (1 + i * delta)` used by MC³ samplers.
pub fn incremental_ladder(chains: usize, delta: f64) -> Result<Vec<f64>, ConfigError> {
    if chains == 0 {
        return Err(ConfigError::EmptyLadder);
    }
    if !(delta >= 0.) || !delta.is_finite() {
        return Err(ConfigError::NonPositive { name: "delta" });
    }
    Ok((0..chains).map(|i| 1. / (1. + i as f64 * delta)).collect())
}

/// A geometric ladder from 1 down to `hottest`.
pub fn geometric_ladder(chains: usize, hottest: f64) -> Result<Vec<f64>, ConfigError> {
    if chains == 0 {
        return Err(ConfigError::EmptyLadder);
    }
    if !(hottest > 0. && hottest <= 1.) {
        return Err(ConfigError::InvalidTemperature {
            chain: chains - 1,
            temperature: hottest,
        });
    }
    if chains == 1 {
        return Ok(vec![1.]);
    }
    let last = (chains - 1) as f64;
    Ok((0..chains)
        .map(|i| hottest.powf(i as f64 / last))
        .collect())
}

/// Check that all temperatures are in `(0, 1]` and do not increase from the
/// cold chain to the hottest.
pub fn validate_ladder(temperatures: &[f64]) -> Result<(), ConfigError> {
    if temperatures.is_empty() {
        return Err(ConfigError::EmptyLadder);
    }
    for (chain, &temperature) in temperatures.iter().enumerate() {
        if !(temperature > 0. && temperature <= 1.) {
            return Err(ConfigError::InvalidTemperature { chain, temperature });
        }
    }
    for (chain, pair) in temperatures.windows(2).enumerate() {
        if pair[1] > pair[0] {
            return Err(ConfigError::NonMonotonicLadder {
                chain: chain + 1,
                previous: pair[0],
                next: pair[1],
            });
        }
    }
    Ok(())
}

/// Probability of exchanging the states of two chains.
///
/// `beta_*` are the temperatures and `logp_*` the untempered log densities of
/// the current states. Equal temperatures always swap; a `NaN` result never
/// does.
pub fn swap_acceptance(beta_i: f64, logp_i: f64, beta_j: f64, logp_j: f64) -> f64 {
    if beta_i == beta_j {
        return 1.;
    }
    let log_ratio = (beta_i - beta_j) * (logp_j - logp_i);
    if log_ratio.is_nan() {
        return 0.;
    }
    log_ratio.min(0.).exp()
}

/// Draw the swap decision for one pair.
pub fn accept_swap<R: Rng + ?Sized>(
    rng: &mut R,
    beta_i: f64,
    logp_i: f64,
    beta_j: f64,
    logp_j: f64,
) -> bool {
    let probability = swap_acceptance(beta_i, logp_i, beta_j, logp_j);
    rng.random::<f64>() < probability
}

/// How pairs of chains are chosen at a swap event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwapScheme {
    /// One random pair of neighbours on the ladder per proposal.
    #[default]
    RandomAdjacent,
    /// Two random distinct chains per proposal.
    RandomPair,
    /// All disjoint neighbour pairs, alternating between even and odd
    /// offsets from one event to the next.
    AlternatingAdjacent,
}

impl SwapScheme {
    /// The pairs to attempt at swap event number `event`, in order.
    ///
    /// Pairs are ordered `(i, j)` with `i < j`.
    pub fn pairs<R: Rng + ?Sized>(
        self,
        rng: &mut R,
        chains: usize,
        event: u64,
        swaps_per_event: usize,
    ) -> Vec<(usize, usize)> {
        if chains < 2 {
            return vec![];
        }
        match self {
            SwapScheme::RandomAdjacent => (0..swaps_per_event)
                .map(|_| {
                    let i = rng.random_range(0..chains - 1);
                    (i, i + 1)
                })
                .collect(),
            SwapScheme::RandomPair => (0..swaps_per_event)
                .map(|_| {
                    let i = rng.random_range(0..chains);
                    let mut j = rng.random_range(0..chains - 1);
                    if j >= i {
                        j += 1;
                    }
                    (i.min(j), i.max(j))
                })
                .collect(),
            SwapScheme::AlternatingAdjacent => {
                let offset = (event % 2) as usize;
                (offset..chains - 1)
                    .step_by(2)
                    .map(|i| (i, i + 1))
                    .collect()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PairStats {
    pub attempted: u64,
    pub accepted: u64,
}

impl PairStats {
    pub fn acceptance_rate(&self) -> Option<f64> {
        if self.attempted == 0 {
            None
        } else {
            Some(self.accepted as f64 / self.attempted as f64)
        }
    }
}

/// Attempted and accepted swaps per pair of chains.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwapStats {
    pairs: BTreeMap<(usize, usize), PairStats>,
}

impl SwapStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, i: usize, j: usize, accepted: bool) {
        let stats = self.pairs.entry((i.min(j), i.max(j))).or_default();
        stats.attempted += 1;
        if accepted {
            stats.accepted += 1;
        }
    }

    pub fn pair(&self, i: usize, j: usize) -> PairStats {
        self.pairs
            .get(&(i.min(j), i.max(j)))
            .copied()
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), PairStats)> + '_ {
        self.pairs.iter().map(|(&pair, &stats)| (pair, stats))
    }

    pub fn attempted(&self) -> u64 {
        self.pairs.values().map(|s| s.attempted).sum()
    }

    pub fn accepted(&self) -> u64 {
        self.pairs.values().map(|s| s.accepted).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn ladders() {
        let ladder = incremental_ladder(4, 0.5).unwrap();
        assert_eq!(ladder, vec![1., 1. / 1.5, 0.5, 1. / 2.5]);
        assert!(validate_ladder(&ladder).is_ok());

        let ladder = geometric_ladder(3, 0.25).unwrap();
        assert_abs_diff_eq!(ladder[0], 1.);
        assert_abs_diff_eq!(ladder[1], 0.5);
        assert_abs_diff_eq!(ladder[2], 0.25);
        assert_eq!(geometric_ladder(1, 0.1).unwrap(), vec![1.]);

        assert_eq!(incremental_ladder(0, 0.1), Err(ConfigError::EmptyLadder));
        assert!(geometric_ladder(3, 0.).is_err());
        assert_eq!(incremental_ladder(3, 0.).unwrap(), vec![1.; 3]);
    }

    #[test]
    fn ladder_validation() {
        assert_eq!(validate_ladder(&[]), Err(ConfigError::EmptyLadder));
        assert_eq!(
            validate_ladder(&[1., 0.5, 0.7]),
            Err(ConfigError::NonMonotonicLadder {
                chain: 2,
                previous: 0.5,
                next: 0.7
            })
        );
        assert!(matches!(
            validate_ladder(&[1., 1.2]),
            Err(ConfigError::InvalidTemperature { chain: 1, .. })
        ));
        assert!(matches!(
            validate_ladder(&[0.]),
            Err(ConfigError::InvalidTemperature { chain: 0, .. })
        ));
        assert!(validate_ladder(&[1., 1., 0.3]).is_ok());
    }

    #[test]
    fn swap_probability() {
        // The hot chain found the better state: always swap.
        assert_eq!(swap_acceptance(1., -10., 0.5, -2.), 1.);
        assert_abs_diff_eq!(
            swap_acceptance(1., -2., 0.5, -10.),
            (-4f64).exp(),
            epsilon = 1e-12
        );
        assert_eq!(swap_acceptance(1., f64::NAN, 0.5, -1.), 0.);
        assert_eq!(swap_acceptance(1., -1., 0.5, f64::NEG_INFINITY), 0.);
    }

    proptest! {
        #[test]
        fn equal_temperatures_always_swap(
            beta in 0.001f64..=1.,
            logp_i in prop::num::f64::ANY,
            logp_j in prop::num::f64::ANY,
        ) {
            prop_assert_eq!(swap_acceptance(beta, logp_i, beta, logp_j), 1.);
            let mut rng = StdRng::seed_from_u64(0);
            prop_assert!(accept_swap(&mut rng, beta, logp_i, beta, logp_j));
        }

        #[test]
        fn swap_probability_in_unit_interval(
            beta_i in 0.001f64..=1.,
            beta_j in 0.001f64..=1.,
            logp_i in -1e6f64..1e6,
            logp_j in -1e6f64..1e6,
        ) {
            let p = swap_acceptance(beta_i, logp_i, beta_j, logp_j);
            prop_assert!((0. ..=1.).contains(&p));
            let q = swap_acceptance(beta_j, logp_j, beta_i, logp_i);
            prop_assert_eq!(p, q);
        }
    }

    #[test]
    fn swap_decision_frequency() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 100_000;
        let accepted = (0..n)
            .filter(|_| accept_swap(&mut rng, 1., -2., 0.5, -3.))
            .count();
        assert_abs_diff_eq!(accepted as f64 / n as f64, (-0.5f64).exp(), epsilon = 0.01);
    }

    #[test]
    fn pair_proposals() {
        let mut rng = StdRng::seed_from_u64(1);
        for event in 0..200 {
            for (i, j) in SwapScheme::RandomAdjacent.pairs(&mut rng, 5, event, 2) {
                assert_eq!(j, i + 1);
                assert!(j < 5);
            }
            let pairs = SwapScheme::RandomPair.pairs(&mut rng, 5, event, 3);
            assert_eq!(pairs.len(), 3);
            for (i, j) in pairs {
                assert!(i < j && j < 5);
            }
        }
        let even = SwapScheme::AlternatingAdjacent.pairs(&mut rng, 5, 0, 1);
        let odd = SwapScheme::AlternatingAdjacent.pairs(&mut rng, 5, 1, 1);
        assert_eq!(even, vec![(0, 1), (2, 3)]);
        assert_eq!(odd, vec![(1, 2), (3, 4)]);
        assert!(SwapScheme::RandomAdjacent.pairs(&mut rng, 1, 0, 1).is_empty());
    }

    #[test]
    fn pair_statistics() {
        let mut stats = SwapStats::new();
        stats.record(0, 1, true);
        stats.record(1, 0, false);
        stats.record(2, 3, true);
        assert_eq!(
            stats.pair(0, 1),
            PairStats {
                attempted: 2,
                accepted: 1
            }
        );
        assert_eq!(stats.pair(1, 2), PairStats::default());
        assert_eq!(stats.pair(0, 1).acceptance_rate(), Some(0.5));
        assert_eq!(stats.attempted(), 3);
        assert_eq!(stats.accepted(), 2);
        assert_eq!(stats.iter().count(), 2);
    }
}
