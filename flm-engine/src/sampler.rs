//! Token sampler.
//!
//! Filters compose in a fixed order: repetition penalty, frequency penalty,
//! temperature, top-k, top-p, then a uniform draw over the renormalized
//! distribution. A non-positive temperature short-circuits to argmax, and
//! ties always break toward the lower token id, so greedy decoding is
//! deterministic.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy)]
pub struct SamplerParams {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            top_k: 5,
            top_p: 0.9,
            repetition_penalty: 1.1,
            frequency_penalty: 0.0,
        }
    }
}

pub struct Sampler {
    pub params: SamplerParams,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: SamplerParams) -> Self {
        Self {
            params,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic RNG stream, for tests and benchmarking.
    pub fn with_seed(params: SamplerParams, seed: u64) -> Self {
        Self {
            params,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Pick the next token. `history` is the token context so far;
    /// `counts` maps token id to its occurrence count in the context.
    pub fn sample(
        &mut self,
        logits: &mut [f32],
        history: &[u32],
        counts: &HashMap<u32, u32>,
    ) -> u32 {
        let params = self.params;

        if params.repetition_penalty > 0.0 && params.repetition_penalty != 1.0 {
            for &token in history {
                let Some(logit) = logits.get_mut(token as usize) else {
                    continue;
                };
                if *logit > 0.0 {
                    *logit /= params.repetition_penalty;
                } else {
                    *logit *= params.repetition_penalty;
                }
            }
        }

        if params.frequency_penalty != 0.0 {
            for (&token, &count) in counts {
                if let Some(logit) = logits.get_mut(token as usize) {
                    *logit -= params.frequency_penalty * count as f32;
                }
            }
        }

        if params.temperature <= 0.0 {
            return argmax(logits);
        }
        for logit in logits.iter_mut() {
            *logit /= params.temperature;
        }

        // top-k: keep the k largest, ties toward the lower id.
        let mut candidates: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| (id as u32, logit))
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
        let k = params.top_k.max(1).min(candidates.len());
        candidates.truncate(k);

        // top-p over the softmax of what survived: the smallest prefix whose
        // probability mass reaches p.
        let max_logit = candidates[0].1;
        let mut probs: Vec<f32> = candidates
            .iter()
            .map(|&(_, logit)| (logit - max_logit).exp())
            .collect();
        let total: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= total;
        }
        if params.top_p > 0.0 && params.top_p < 1.0 {
            let mut mass = 0.0;
            let mut keep = probs.len();
            for (i, &p) in probs.iter().enumerate() {
                mass += p;
                if mass >= params.top_p {
                    keep = i + 1;
                    break;
                }
            }
            candidates.truncate(keep);
            probs.truncate(keep);
            let total: f32 = probs.iter().sum();
            for p in probs.iter_mut() {
                *p /= total;
            }
        }

        let draw: f32 = self.rng.gen();
        let mut mass = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            mass += p;
            if draw < mass {
                return candidates[i].0;
            }
        }
        candidates.last().map(|&(id, _)| id).unwrap_or(0)
    }
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &logit) in logits.iter().enumerate() {
        if logit > logits[best] {
            best = i;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(temperature: f32, top_k: usize, top_p: f32) -> SamplerParams {
        SamplerParams {
            temperature,
            top_k,
            top_p,
            repetition_penalty: 1.0,
            frequency_penalty: 0.0,
        }
    }

    #[test]
    fn test_zero_temperature_is_argmax() {
        let mut sampler = Sampler::new(params(0.0, 5, 0.9));
        let mut logits = vec![0.1, 3.0, 2.9, -1.0];
        assert_eq!(sampler.sample(&mut logits, &[], &HashMap::new()), 1);
    }

    #[test]
    fn test_argmax_ties_break_to_lower_id() {
        let mut sampler = Sampler::new(params(0.0, 5, 0.9));
        let mut logits = vec![1.0, 5.0, 5.0, 5.0];
        assert_eq!(sampler.sample(&mut logits, &[], &HashMap::new()), 1);
    }

    #[test]
    fn test_top_k_one_is_deterministic() {
        let mut a = Sampler::new(params(0.8, 1, 1.0));
        let mut b = Sampler::new(params(0.8, 1, 1.0));
        for _ in 0..16 {
            let mut la = vec![0.5, 2.0, 1.9, -3.0];
            let mut lb = la.clone();
            let ta = a.sample(&mut la, &[], &HashMap::new());
            let tb = b.sample(&mut lb, &[], &HashMap::new());
            assert_eq!(ta, tb);
            assert_eq!(ta, 1);
        }
    }

    #[test]
    fn test_repetition_penalty_divides_positive_multiplies_negative() {
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
            repetition_penalty: 2.0,
            frequency_penalty: 0.0,
        });
        // Token 0 was used; its logit halves and token 1 wins.
        let mut logits = vec![3.0, 2.0];
        assert_eq!(sampler.sample(&mut logits, &[0], &HashMap::new()), 1);
        assert_eq!(logits[0], 1.5);

        // A negative logit moves further down.
        let mut logits = vec![-1.0, -3.0];
        sampler.sample(&mut logits, &[0], &HashMap::new());
        assert_eq!(logits[0], -2.0);
    }

    #[test]
    fn test_frequency_penalty_scales_with_count() {
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
            repetition_penalty: 1.0,
            frequency_penalty: 0.5,
        });
        let mut counts = HashMap::new();
        counts.insert(0u32, 4u32);
        let mut logits = vec![3.0, 2.5];
        // 3.0 - 0.5 * 4 = 1.0, so token 1 wins.
        assert_eq!(sampler.sample(&mut logits, &[], &counts), 1);
    }

    #[test]
    fn test_top_p_keeps_smallest_sufficient_prefix() {
        // One dominant token with p small enough that only it survives.
        let mut sampler = Sampler::with_seed(params(1.0, 10, 0.5), 7);
        for _ in 0..32 {
            let mut logits = vec![10.0, 0.0, 0.0, 0.0];
            assert_eq!(sampler.sample(&mut logits, &[], &HashMap::new()), 0);
        }
    }

    #[test]
    fn test_draws_stay_inside_top_k() {
        let mut sampler = Sampler::with_seed(params(1.0, 2, 1.0), 11);
        for _ in 0..64 {
            let mut logits = vec![2.0, 1.9, -8.0, -9.0];
            let token = sampler.sample(&mut logits, &[], &HashMap::new());
            assert!(token == 0 || token == 1, "token {token} escaped top-k");
        }
    }
}
