//! Perturbed amount generation.
//!
//! Since a payer cannot be forced to attach a memo, the sub-unit digits of
//! the amount are the only identifier a transfer carries. Each new form gets
//! `base + delta` with a random 4-decimal delta chosen so the result stays
//! clear of every amount the reconciler could currently observe.

use crate::utils::round4;
use rand::Rng;
use tracing::{debug, warn};

const MAX_ATTEMPTS: usize = 100;

/// Minimum distance between two distinguishable amounts.
pub const AMOUNT_TOLERANCE: f64 = 1e-4;

/// Produce `round(base + delta, 4)` with `delta` in [0.0001, 0.9999] such
/// that the result differs from every collision amount by at least
/// [`AMOUNT_TOLERANCE`]. Falls back to a single uniform draw after
/// `MAX_ATTEMPTS`; the result is always strictly greater than `base` and
/// exactly 4 decimal places.
pub fn generate_unique_amount(base_amount: f64, collision_amounts: &[f64]) -> f64 {
    let mut rng = rand::rng();

    for attempt in 0..MAX_ATTEMPTS {
        let delta = f64::from(rng.random_range(1..=9999u32)) / 10_000.0;
        let candidate = round4(base_amount + delta);

        let unique = collision_amounts
            .iter()
            .all(|amount| (candidate - amount).abs() >= AMOUNT_TOLERANCE);
        if unique {
            debug!(attempt, "generated unique perturbed amount");
            return candidate;
        }
    }

    let delta: f64 = rng.random_range(0.0001..=0.9999);
    let fallback = round4(base_amount + delta);
    warn!("amount perturbation attempts exhausted, using uniform fallback");
    fallback
}
