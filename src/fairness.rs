//! Provably fair crash point generation.
//!
//! Each round draws a fresh 32-byte server seed from the OS CSPRNG when it
//! starts running. The crash point is derived from `SHA-256(seed ‖ round ‖ nonce)`
//! with an inverse-exponential transform and a house edge. The seed hash is
//! published at round start and the seed itself once the round crashes, so
//! anyone can recompute the result.

use crate::{
    multiplier::Multiplier,
    types::RoundId,
};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Smallest `1 - r` accepted by the transform before resampling
const MIN_TAIL: f64 = 1e-12;

/// Upper bound on resampling attempts for a single draw
const MAX_NONCE: u32 = 64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FairnessError {
    #[error("OS entropy source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("Invalid server seed: {0}")]
    InvalidSeed(String),

    #[error("No valid sample for round {0} after {1} attempts")]
    Exhausted(RoundId, u32),
}

/// House parameters of the crash distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FairnessParams {
    pub house_edge: f64,
    pub max_crash_point: Multiplier,
}

impl Default for FairnessParams {
    fn default() -> Self {
        Self {
            house_edge: 0.03,
            max_crash_point: Multiplier::from_hundredths(1_000_000),
        }
    }
}

/// Result of one crash point draw
#[derive(Debug, Clone, PartialEq)]
pub struct FairDraw {
    pub round_id: RoundId,
    pub crash_point: Multiplier,
    pub server_seed: [u8; 32],
    pub seed_hash: String,
    pub nonce: u32,
}

impl FairDraw {
    pub fn server_seed_hex(&self) -> String {
        hex::encode(self.server_seed)
    }
}

/// Recomputed outcome for public verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub round_id: RoundId,
    pub crash_point: Multiplier,
    pub seed_hash: String,
    pub nonce: u32,
}

/// Source of crash points consulted once per round by the scheduler
pub trait CrashPointSource: Send {
    fn draw(&mut self, round_id: RoundId) -> Result<FairDraw, FairnessError>;
}

/// Hex SHA-256 commitment of a server seed
pub fn seed_commitment(seed: &[u8]) -> String {
    hex::encode(Sha256::digest(seed))
}

/// Crash point generator backed by the OS CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct CrashPointGenerator {
    params: FairnessParams,
}

impl CrashPointGenerator {
    pub fn new(params: FairnessParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> FairnessParams {
        self.params
    }

    /// Draw a crash point with a fresh random seed
    pub fn generate(&self, round_id: RoundId) -> Result<FairDraw, FairnessError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| FairnessError::EntropyUnavailable(e.to_string()))?;
        self.draw_from_seed(seed, round_id)
    }

    /// Deterministic draw for a known seed
    pub fn draw_from_seed(&self, seed: [u8; 32], round_id: RoundId) -> Result<FairDraw, FairnessError> {
        for nonce in 0..MAX_NONCE {
            let r = uniform_from_seed(&seed, round_id, nonce);
            if let Some(crash_point) = self.crash_point_from_uniform(r) {
                return Ok(FairDraw {
                    round_id,
                    crash_point,
                    server_seed: seed,
                    seed_hash: seed_commitment(&seed),
                    nonce,
                });
            }
        }
        Err(FairnessError::Exhausted(round_id, MAX_NONCE))
    }

    /// `clamp(floor2(max(1, (1 - h) / (1 - r))), 1, ceiling)`, or `None`
    /// when `r` is too close to 1 for the transform to be defined.
    pub fn crash_point_from_uniform(&self, r: f64) -> Option<Multiplier> {
        if !(0.0..1.0).contains(&r) {
            return None;
        }
        let tail = 1.0 - r;
        if tail < MIN_TAIL {
            return None;
        }
        let raw = ((1.0 - self.params.house_edge) / tail).max(1.0);
        let crash_point = Multiplier::from_f64_floor(raw)?;
        Some(crash_point.clamp(Multiplier::ONE, self.params.max_crash_point))
    }

    /// Recompute a published round from its revealed seed
    pub fn verify(&self, seed_hex: &str, round_id: RoundId) -> Result<Verification, FairnessError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| FairnessError::InvalidSeed(format!("not hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FairnessError::InvalidSeed("seed must be 32 bytes".to_string()))?;

        let draw = self.draw_from_seed(seed, round_id)?;
        Ok(Verification {
            round_id,
            crash_point: draw.crash_point,
            seed_hash: draw.seed_hash,
            nonce: draw.nonce,
        })
    }
}

impl CrashPointSource for CrashPointGenerator {
    fn draw(&mut self, round_id: RoundId) -> Result<FairDraw, FairnessError> {
        self.generate(round_id)
    }
}

/// Uniform `r ∈ [0, 1)` from the top 52 bits of the round digest
pub fn uniform_from_seed(seed: &[u8; 32], round_id: RoundId, nonce: u32) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(round_id.0.to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let bits = u64::from_be_bytes(head) >> 12;
    bits as f64 / (1u64 << 52) as f64
}

/// Crash point source that always returns the same value
#[derive(Debug, Clone, Copy)]
pub struct FixedCrashPoint(pub Multiplier);

impl CrashPointSource for FixedCrashPoint {
    fn draw(&mut self, round_id: RoundId) -> Result<FairDraw, FairnessError> {
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&round_id.0.to_be_bytes());
        Ok(FairDraw {
            round_id,
            crash_point: self.0,
            server_seed: seed,
            seed_hash: seed_commitment(&seed),
            nonce: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, RngCore as _, SeedableRng};

    fn sample(generator: &CrashPointGenerator, count: usize) -> Vec<Multiplier> {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        (0..count)
            .map(|i| {
                let mut seed = [0u8; 32];
                rng.fill_bytes(&mut seed);
                generator
                    .draw_from_seed(seed, RoundId(i as u64))
                    .unwrap()
                    .crash_point
            })
            .collect()
    }

    #[test]
    fn test_transform_edges() {
        let generator = CrashPointGenerator::default();

        assert_eq!(generator.crash_point_from_uniform(0.0), Some(Multiplier::ONE));
        assert_eq!(
            generator.crash_point_from_uniform(0.5),
            Some(Multiplier::from_hundredths(194))
        );
        assert_eq!(
            generator.crash_point_from_uniform(0.99),
            Some(Multiplier::from_hundredths(9_700))
        );
        assert_eq!(
            generator.crash_point_from_uniform(1.0 - 1e-9),
            Some(generator.params().max_crash_point)
        );
        assert_eq!(generator.crash_point_from_uniform(1.0 - 1e-14), None);
        assert_eq!(generator.crash_point_from_uniform(1.0), None);
    }

    #[test]
    fn test_samples_within_bounds() {
        let generator = CrashPointGenerator::default();
        for crash_point in sample(&generator, 20_000) {
            assert!(crash_point >= Multiplier::ONE);
            assert!(crash_point <= generator.params().max_crash_point);
        }
    }

    #[test]
    fn test_fixed_target_return_matches_house_edge() {
        let generator = CrashPointGenerator::default();
        let samples = sample(&generator, 100_000);
        let target = Multiplier::from_hundredths(200);

        let reached = samples.iter().filter(|&&c| c >= target).count() as f64;
        let survival = reached / samples.len() as f64;
        let expected_return = survival * target.as_f64();

        // P(crash >= x) = (1 - h) / x, so every fixed target returns 1 - h
        assert!((survival - 0.485).abs() < 0.01, "survival {}", survival);
        assert!((expected_return - 0.97).abs() < 0.02, "return {}", expected_return);
    }

    #[test]
    fn test_verify_round_trip() {
        let generator = CrashPointGenerator::default();
        let draw = generator.generate(RoundId(42)).unwrap();
        let verification = generator.verify(&draw.server_seed_hex(), RoundId(42)).unwrap();

        assert_eq!(verification.crash_point, draw.crash_point);
        assert_eq!(verification.seed_hash, draw.seed_hash);
        assert_eq!(verification.seed_hash, seed_commitment(&draw.server_seed));
    }

    #[test]
    fn test_verify_rejects_bad_seed() {
        let generator = CrashPointGenerator::default();
        assert!(matches!(
            generator.verify("zz", RoundId(1)),
            Err(FairnessError::InvalidSeed(_))
        ));
        assert!(matches!(
            generator.verify("abcd", RoundId(1)),
            Err(FairnessError::InvalidSeed(_))
        ));
    }

    #[test]
    fn test_uniform_range() {
        let seed = [7u8; 32];
        for nonce in 0..1_000 {
            let r = uniform_from_seed(&seed, RoundId(3), nonce);
            assert!((0.0..1.0).contains(&r));
        }
    }
}
