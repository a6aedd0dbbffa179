//! Flow configuration for calls.
//!
//! Supports:
//! - CLI arguments via clap (flatten [`FlowConfig`] into a binary's parser)
//! - Environment variable overrides
//! - Defaults that keep one message buffered per direction

use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

/// Queue sizing and deadline for a call.
#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Values buffered for the consumer before credit is withheld
    #[arg(long, env = "BACKFLOW_INBOUND_CAPACITY", default_value_t = 1)]
    pub inbound_capacity: usize,

    /// Values buffered for the transport before senders wait
    #[arg(long, env = "BACKFLOW_OUTBOUND_CAPACITY", default_value_t = 1)]
    pub outbound_capacity: usize,

    /// Cancel the call after this many milliseconds (no deadline if unset)
    #[arg(long, env = "BACKFLOW_DEADLINE_MS")]
    pub deadline_ms: Option<u64>,
}

impl FlowConfig {
    /// Same capacity for both directions.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inbound_capacity: capacity,
            outbound_capacity: capacity,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn deadline_duration(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 1,
            outbound_capacity: 1,
            deadline_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        flow: FlowConfig,
    }

    #[test]
    fn test_default_config() {
        let config = FlowConfig::default();
        assert_eq!(config.inbound_capacity, 1);
        assert_eq!(config.outbound_capacity, 1);
        assert!(config.deadline_duration().is_none());
    }

    #[test]
    fn test_flattened_args() {
        let cli = Cli::parse_from([
            "bench",
            "--inbound-capacity",
            "8",
            "--deadline-ms",
            "250",
        ]);
        assert_eq!(cli.flow.inbound_capacity, 8);
        assert_eq!(cli.flow.outbound_capacity, 1);
        assert_eq!(cli.flow.deadline_duration(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_builder_helpers() {
        let config = FlowConfig::with_capacity(4).deadline(Duration::from_secs(2));
        assert_eq!(config.outbound_capacity, 4);
        assert_eq!(config.deadline_ms, Some(2000));
    }

    #[test]
    fn test_serializes_for_reports() {
        let json = serde_json::to_value(FlowConfig::default()).unwrap();
        assert_eq!(json["inbound_capacity"], 1);
        assert!(json["deadline_ms"].is_null());
    }
}
