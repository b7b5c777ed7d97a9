// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A `#[test]` replacement that routes `tracing` output into the test
//! harness's captured output.
//!
//! The filter comes from `RUST_LOG` when set and defaults to `debug`. Thread
//! names are included so output from emulated interrupt threads can be told
//! apart from the test thread.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

const DEFAULT_FILTER: &str = "debug";

#[doc(hidden)]
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        // Another harness may already own the global subscriber.
        let _ = tracing_subscriber::fmt()
            .compact()
            .with_ansi(false)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::test;

    #[test]
    fn emits_events() {
        tracing::info!(value = 5, "captured by the test writer");
    }

    #[test]
    fn returns_result() -> Result<(), std::num::ParseIntError> {
        let span = tracing::debug_span!("parse");
        let _guard = span.enter();
        let n: u32 = "42".parse()?;
        assert_eq!(n, 42);
        Ok(())
    }
}
