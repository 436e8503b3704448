// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Narrow ports the kernel depends on: clocks, id minting, signatures.
//!
//! The kernel never reaches for ambient authority — embedders construct these
//! once and hand them to [`crate::Kernel`] and the engines above it. Tests
//! swap in [`FixedClock`] / [`SequentialIds`] to make commits reproducible.

use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};

/// Wall-clock port.
pub trait Clock: Send + Sync {
    /// Current wall time, millis since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Current UTC calendar day as `YYYY-MM-DD`.
    ///
    /// The UTC day is the canonical boundary for streaks and daily counters;
    /// embedders wanting a local-time boundary supply their own `Clock`.
    fn utc_day(&self) -> String {
        utc_day_of(self.now_ms())
    }
}

/// Formats a millis-since-epoch timestamp as its UTC calendar day.
#[must_use]
pub fn utc_day_of(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms.min(i64::MAX as u64) as i64)
        .map_or_else(|| "1970-01-01".to_string(), |dt| dt.format("%Y-%m-%d").to_string())
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Deterministic clock for tests; starts at a fixed instant and only moves
/// when told to.
#[derive(Debug, Default)]
pub struct FixedClock {
    ms: AtomicU64,
}

impl FixedClock {
    /// Creates a clock pinned to `ms`.
    #[must_use]
    pub fn at(ms: u64) -> Self {
        FixedClock {
            ms: AtomicU64::new(ms),
        }
    }

    /// Advances the clock by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Pins the clock to an absolute instant.
    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// Id minting port.
///
/// Ids render as `{prefix}-{16 hex}`; the prefix is the entity type tag (or
/// `delta`), which lets sync recover the type of a genesis delta from its
/// entity id alone.
pub trait IdSource: Send + Sync {
    /// Mints a fresh id with the given prefix.
    fn mint(&self, prefix: &str) -> String;
}

/// Default id source drawing 64 random bits per id.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn mint(&self, prefix: &str) -> String {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("{prefix}-{}", hex::encode(bytes))
    }
}

/// Deterministic id source for tests: `{prefix}-{counter as 16 hex}`.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl IdSource for SequentialIds {
    fn mint(&self, prefix: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n:016x}")
    }
}

/// Detached-signature producer. Optional: nodes without an identity simply
/// leave `signature` absent.
pub trait Signer: Send + Sync {
    /// Signs the canonical byte form, returning an opaque signature string.
    fn sign(&self, canonical: &[u8]) -> String;
}

/// Detached-signature verifier.
pub trait Verifier: Send + Sync {
    /// Verifies a signature over the canonical byte form.
    fn verify(&self, canonical: &[u8], signature: &str) -> bool;
}
