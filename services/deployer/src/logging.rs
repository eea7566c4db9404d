//! Tracing setup for processes embedding the deployer.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber: JSON lines, filtered by `RUST_LOG` or
/// `default_level` when it is unset.
///
/// Fails if a global subscriber is already installed.
pub fn init(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| level_filter(default_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .context("Installing tracing subscriber")
}

fn level_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).with_context(|| format!("Invalid log level '{level}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter("debug").unwrap().to_string(), "debug");
        assert!(level_filter("dirboot_deployer=trace,warn").is_ok());
    }

    #[test]
    fn test_invalid_level_filter() {
        let err = level_filter("dirboot_deployer=loud").unwrap_err();
        assert_eq!(err.to_string(), "Invalid log level 'dirboot_deployer=loud'");
    }
}
