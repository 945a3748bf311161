//! Internal utilities to support testing.

use std::{future::Future, time::Duration};

use anyhow::Context;
use rand::SeedableRng;

pub mod logging;

/// Deterministic rng seeded from a string, so every test can have its own key material.
pub fn test_rng(seed: &[u8]) -> rand_chacha::ChaCha12Rng {
    let mut bytes = [0u8; 32];
    for (i, b) in seed.iter().enumerate() {
        bytes[i % 32] ^= *b;
    }
    rand_chacha::ChaCha12Rng::from_seed(bytes)
}

/// Poll `check` every 50ms until it returns true, failing after `timeout`.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("condition not reached in time")
}
