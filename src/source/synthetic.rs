use std::f64::consts::PI;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::chunk::Chunk;
use crate::source::Cadence;

/// Standard deviation of generated samples, in signal units.
pub const NOISE_STD_DEV: f64 = 15.0;

/// Zero-mean Gaussian noise, one chunk per cadence tick.
#[derive(Debug)]
pub struct SyntheticNoise {
    channels: usize,
    samples_per_channel: usize,
    std_dev: f64,
    rng: StdRng,
    cadence: Cadence,
}

impl SyntheticNoise {
    /// Noise generator seeded from the operating system.
    #[must_use]
    pub fn new(channels: usize, samples_per_channel: usize, period: Duration) -> Self {
        Self::with_rng(channels, samples_per_channel, period, StdRng::from_os_rng())
    }

    /// Deterministic generator for reproducible runs.
    #[must_use]
    pub fn with_seed(channels: usize, samples_per_channel: usize, period: Duration, seed: u64) -> Self {
        Self::with_rng(channels, samples_per_channel, period, StdRng::seed_from_u64(seed))
    }

    fn with_rng(channels: usize, samples_per_channel: usize, period: Duration, rng: StdRng) -> Self {
        Self {
            channels,
            samples_per_channel,
            std_dev: NOISE_STD_DEV,
            rng,
            cadence: Cadence::new(period),
        }
    }

    /// One Box-Muller sample.
    fn gaussian(&mut self) -> f32 {
        let u1 = self.rng.random::<f64>().max(1e-10);
        let u2 = self.rng.random::<f64>();
        ((-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * self.std_dev) as f32
    }

    /// Generates a chunk immediately.
    pub fn generate(&mut self) -> Chunk {
        let len = self.channels * self.samples_per_channel;
        let samples = (0..len).map(|_| self.gaussian()).collect();
        Chunk::new(samples)
    }

    /// Waits one cadence period, then generates a chunk.
    pub async fn next_chunk(&mut self) -> Chunk {
        self.cadence.tick().await;
        self.generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::health::count_anomalies;

    #[test]
    fn test_chunk_shape() {
        let mut noise = SyntheticNoise::with_seed(32, 160, Duration::from_millis(100), 7);
        assert_eq!(noise.generate().len(), 32 * 160);
    }

    #[test]
    fn test_noise_statistics() {
        let mut noise = SyntheticNoise::with_seed(32, 160, Duration::from_millis(100), 42);
        let chunk = noise.generate();
        let n = chunk.len() as f64;
        let mean = chunk.samples().iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let var = chunk
            .samples()
            .iter()
            .map(|&v| (f64::from(v) - mean).powi(2))
            .sum::<f64>()
            / n;
        assert!(mean.abs() < 1.0, "mean {mean}");
        assert!((var.sqrt() - NOISE_STD_DEV).abs() < 1.0, "std {}", var.sqrt());
    }

    #[test]
    fn test_noise_stays_healthy_by_default() {
        // 50 units is more than 3 sigma: a handful of anomalies per chunk, far below 800.
        let mut noise = SyntheticNoise::with_seed(32, 160, Duration::from_millis(100), 3);
        for _ in 0..10 {
            assert!(count_anomalies(noise.generate().samples(), 50.0) < 200);
        }
    }

    #[test]
    fn test_same_seed_same_samples() {
        let mut a = SyntheticNoise::with_seed(2, 160, Duration::from_millis(100), 11);
        let mut b = SyntheticNoise::with_seed(2, 160, Duration::from_millis(100), 11);
        assert_eq!(a.generate(), b.generate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_chunk_follows_cadence() {
        let mut noise = SyntheticNoise::with_seed(1, 160, Duration::from_millis(100), 1);
        let start = tokio::time::Instant::now();
        noise.next_chunk().await;
        noise.next_chunk().await;
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }
}
