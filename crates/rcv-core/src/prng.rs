//! Xorshift32 generator used for volume simulation.
//!
//! Not cryptographic. A run is reproducible when the caller supplies the
//! seed; the wall clock is only a fallback for scheduled runs.

use chrono::Utc;

/// Substituted for a zero seed, which would otherwise lock the state at zero.
pub const DEFAULT_SEED: u32 = 123_456_789;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xorshift32 {
    seed: u32,
    state: u32,
}

impl Xorshift32 {
    pub fn new(seed: u32) -> Self {
        let seed = if seed == 0 { DEFAULT_SEED } else { seed };
        Self { seed, state: seed }
    }

    pub fn from_clock() -> Self {
        Self::new(clock_seed())
    }

    /// Seed the generator was created with, after zero substitution.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.next_u32()) / (f64::from(u32::MAX) + 1.0)
    }

    pub fn chance(&mut self, probability: f64) -> bool {
        self.next_f64() < probability
    }

    /// `floor(base + draw * span)`.
    pub fn floor_range(&mut self, base: u32, span: u32) -> u32 {
        (f64::from(base) + self.next_f64() * f64::from(span)).floor() as u32
    }

    /// Uniform index into a collection of `len` items. `len` must be non-zero.
    pub fn index(&mut self, len: usize) -> usize {
        let index = (self.next_f64() * len as f64).floor() as usize;
        index.min(len.saturating_sub(1))
    }

    /// Box-Muller standard normal; both uniforms are clamped away from zero.
    pub fn standard_normal(&mut self) -> f64 {
        let u1 = self.next_f64().max(1e-9);
        let u2 = self.next_f64().max(1e-9);
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

pub fn clock_seed() -> u32 {
    Utc::now().timestamp_millis() as u32
}
