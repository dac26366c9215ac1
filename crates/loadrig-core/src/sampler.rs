use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeded probability gate for weighted scenario operations.
///
/// Each VU derives its own sampler from the run seed, so a run is
/// reproducible and VUs never share RNG state.
#[derive(Debug)]
pub struct Sampler {
    rng: Mutex<StdRng>,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn for_vu(seed: u64, vu_id: u64) -> Self {
        Self::new(seed.wrapping_add(vu_id))
    }

    /// True with probability `p`; out-of-range probabilities clamp.
    pub fn chance(&self, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.rng.lock().gen::<f64>() < p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_draws() {
        let a = Sampler::new(7);
        let b = Sampler::new(7);

        for _ in 0..100 {
            assert_eq!(a.chance(0.5), b.chance(0.5));
        }
    }

    #[test]
    fn test_clamped_probabilities() {
        let sampler = Sampler::new(1);
        assert!(!sampler.chance(0.0));
        assert!(!sampler.chance(-1.0));
        assert!(sampler.chance(1.0));
        assert!(sampler.chance(2.0));
    }

    #[test]
    fn test_one_percent_gate_over_many_draws() {
        // 100k draws at p=0.01: expectation 1000, std dev ~31. Four sigma
        // keeps this deterministic-in-practice for any fixed seed.
        let sampler = Sampler::new(42);
        let hits = (0..100_000).filter(|_| sampler.chance(0.01)).count();
        assert!(
            (875..=1125).contains(&hits),
            "expected ~1000 hits, got {hits}"
        );
    }
}
