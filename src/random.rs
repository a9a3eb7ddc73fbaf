//! Random variate source for pseudo-data generation.
//!
//! All randomness consumed by the ensemble engine flows through a
//! [`RandomSource`], so a fixed seed and a fixed call order reproduce every
//! ensemble bit for bit.

use crate::error::{EnsembleError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Poisson};
use serde::{Deserialize, Serialize};

/// A single draw request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Draw {
    /// Uniform on `[lo, hi)`.
    Uniform { lo: f64, hi: f64 },
    /// Gaussian with the given mean and standard deviation.
    Gaussian { mean: f64, sigma: f64 },
    /// Poisson with the given mean.
    Poisson { mean: f64 },
}

impl Draw {
    /// Check the distribution parameters without consuming randomness.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Draw::Uniform { lo, hi } => {
                if !lo.is_finite() || !hi.is_finite() {
                    return Err(invalid("uniform", format!("non-finite bounds [{lo}, {hi})")));
                }
                if lo > hi {
                    return Err(invalid("uniform", format!("lower bound {lo} exceeds upper bound {hi}")));
                }
            }
            Draw::Gaussian { mean, sigma } => {
                if !mean.is_finite() {
                    return Err(invalid("gaussian", format!("non-finite mean {mean}")));
                }
                if !sigma.is_finite() || sigma < 0.0 {
                    return Err(invalid("gaussian", format!("sigma must be >= 0, got {sigma}")));
                }
            }
            Draw::Poisson { mean } => {
                if !mean.is_finite() || mean < 0.0 {
                    return Err(invalid("poisson", format!("mean must be >= 0, got {mean}")));
                }
            }
        }
        Ok(())
    }
}

fn invalid(distribution: &'static str, reason: String) -> EnsembleError {
    EnsembleError::InvalidDistributionParameter {
        distribution,
        reason,
    }
}

/// Source of independent random variates.
pub trait RandomSource {
    /// Draw one value from the requested distribution.
    fn draw(&mut self, draw: Draw) -> Result<f64>;

    /// Number of values drawn so far.
    fn draws(&self) -> u64;

    fn uniform(&mut self, lo: f64, hi: f64) -> Result<f64> {
        self.draw(Draw::Uniform { lo, hi })
    }

    fn gaussian(&mut self, mean: f64, sigma: f64) -> Result<f64> {
        self.draw(Draw::Gaussian { mean, sigma })
    }

    fn poisson(&mut self, mean: f64) -> Result<f64> {
        self.draw(Draw::Poisson { mean })
    }
}

impl<R: RandomSource + ?Sized> RandomSource for &mut R {
    fn draw(&mut self, draw: Draw) -> Result<f64> {
        (**self).draw(draw)
    }

    fn draws(&self) -> u64 {
        (**self).draws()
    }
}

/// Seeded random stream backed by [`StdRng`].
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: StdRng,
    seed: u64,
    draws: u64,
}

impl SeededRandom {
    /// Create a stream from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
            draws: 0,
        }
    }

    /// Seed this stream was created from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Derive an independent sub-stream.
    ///
    /// The derived seed depends only on this stream's seed and `stream`, never
    /// on how many values have been drawn, so workers can be forked in any order.
    pub fn fork(&self, stream: u64) -> Self {
        Self::new(splitmix64(self.seed ^ splitmix64(stream.wrapping_add(1))))
    }
}

impl RandomSource for SeededRandom {
    fn draw(&mut self, draw: Draw) -> Result<f64> {
        draw.validate()?;
        self.draws += 1;

        let value = match draw {
            Draw::Uniform { lo, hi } => {
                if lo == hi {
                    lo
                } else {
                    self.rng.random_range(lo..hi)
                }
            }
            Draw::Gaussian { mean, sigma } => {
                if sigma == 0.0 {
                    mean
                } else {
                    let normal = Normal::new(mean, sigma)
                        .map_err(|e| invalid("gaussian", e.to_string()))?;
                    normal.sample(&mut self.rng)
                }
            }
            Draw::Poisson { mean } => {
                // Poisson(0) is identically zero.
                if mean == 0.0 {
                    0.0
                } else {
                    let poisson =
                        Poisson::new(mean).map_err(|e| invalid("poisson", e.to_string()))?;
                    poisson.sample(&mut self.rng)
                }
            }
        };

        Ok(value)
    }

    fn draws(&self) -> u64 {
        self.draws
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = SeededRandom::new(7);
        let mut b = SeededRandom::new(7);
        for _ in 0..50 {
            assert_eq!(a.poisson(12.5).unwrap(), b.poisson(12.5).unwrap());
            assert_eq!(a.gaussian(1.0, 2.0).unwrap(), b.gaussian(1.0, 2.0).unwrap());
            assert_eq!(a.uniform(-1.0, 1.0).unwrap(), b.uniform(-1.0, 1.0).unwrap());
        }
        assert_eq!(a.draws(), 150);
    }

    #[test]
    fn test_invalid_parameters_consume_nothing() {
        let mut rng = SeededRandom::new(1);
        assert!(matches!(
            rng.gaussian(0.0, -1.0),
            Err(EnsembleError::InvalidDistributionParameter { distribution: "gaussian", .. })
        ));
        assert!(matches!(
            rng.poisson(-0.5),
            Err(EnsembleError::InvalidDistributionParameter { distribution: "poisson", .. })
        ));
        assert!(rng.uniform(2.0, 1.0).is_err());
        assert!(rng.poisson(f64::NAN).is_err());
        assert_eq!(rng.draws(), 0);
    }

    #[test]
    fn test_degenerate_distributions() {
        let mut rng = SeededRandom::new(3);
        assert_eq!(rng.poisson(0.0).unwrap(), 0.0);
        assert_eq!(rng.gaussian(4.0, 0.0).unwrap(), 4.0);
        assert_eq!(rng.uniform(2.5, 2.5).unwrap(), 2.5);
    }

    #[test]
    fn test_poisson_mean() {
        let mut rng = SeededRandom::new(11);
        let n = 20_000;
        let sum: f64 = (0..n).map(|_| rng.poisson(25.0).unwrap()).sum();
        let mean = sum / n as f64;
        assert!((mean - 25.0).abs() < 0.2, "mean = {}", mean);
    }

    #[test]
    fn test_uniform_bounds() {
        let mut rng = SeededRandom::new(5);
        for _ in 0..1000 {
            let u = rng.uniform(3.0, 4.0).unwrap();
            assert!((3.0..4.0).contains(&u));
        }
    }

    #[test]
    fn test_fork_is_deterministic_and_distinct() {
        let parent = SeededRandom::new(42);
        let mut used = parent.clone();
        used.poisson(3.0).unwrap();

        assert_eq!(parent.fork(2).seed(), used.fork(2).seed());
        assert_ne!(parent.fork(0).seed(), parent.fork(1).seed());
        assert_ne!(parent.fork(0).seed(), parent.seed());
    }
}
