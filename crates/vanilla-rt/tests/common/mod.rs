// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared helpers for the integration tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Route `tracing` output to the test harness. `RUST_LOG` overrides the
/// default filter; repeated calls are harmless.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vanilla_rt=debug"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(true)
        .try_init();
}
