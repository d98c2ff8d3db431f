//! Deterministic random number generation.
//!
//! RULE: Nothing in the simulation may call any platform RNG.
//! All randomness flows through StageRng instances derived from the
//! single master seed in the run configuration.
//!
//! Each (stage, year) pair gets its own stream, seeded deterministically
//! from master_seed XOR a stable slot/year mix. This means:
//!   - Adding a new stage never changes existing stages' streams.
//!   - Results do not depend on thread count or stage scheduling.
//!   - Event UUIDs drawn from a stream are reproducible.

use crate::types::SimulationYear;
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;
use uuid::Uuid;

/// A named, deterministic RNG for a single generation stage and year.
pub struct StageRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl StageRng {
    /// Create a stream from the master seed and a stable stream index.
    /// The index must never change once assigned.
    pub fn new(master_seed: u64, stream_index: u64) -> Self {
        let derived_seed = master_seed ^ (stream_index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            name: "unnamed",
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Draw a raw u64 (full range).
    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    /// Roll a u64 in [0, n). Returns 0 when n is 0.
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        self.inner.next_u64() % n
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Uniform draw in [center - spread, center + spread).
    pub fn around(&mut self, center: f64, spread: f64) -> f64 {
        center + (self.next_f64() * 2.0 - 1.0) * spread
    }

    /// A version-4 shaped UUID built from this stream.
    pub fn next_uuid(&mut self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.inner.fill_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

/// All stage RNGs for a single run.
pub struct RngBank {
    master_seed: u64,
}

impl RngBank {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    pub fn for_stage(&self, slot: StageSlot, year: SimulationYear) -> StageRng {
        // Year in the high bits, slot in the low byte: streams never collide.
        let index = ((year as u64) << 8) | slot as u64;
        StageRng::new(self.master_seed, index).with_name(slot.name())
    }
}

/// Stable stream slot assignments.
/// NEVER reorder or remove entries. Only append.
/// Reordering changes every stage's seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum StageSlot {
    Census = 0,
    Termination = 1,
    Hiring = 2,
    Promotion = 3,
    Raise = 4,
    Enrollment = 5,
    DeferralChange = 6,
    Contribution = 7,
}

impl StageSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Census => "census",
            Self::Termination => "termination",
            Self::Hiring => "hiring",
            Self::Promotion => "promotion",
            Self::Raise => "raise",
            Self::Enrollment => "enrollment",
            Self::DeferralChange => "deferral_change",
            Self::Contribution => "contribution",
        }
    }
}
