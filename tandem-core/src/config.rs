//! Node configuration.

use std::time::Duration;

/// Default window for a caller to start an opened downstream stream.
pub const DEFAULT_STREAM_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Default time a finished call keeps absorbing late frames.
pub const DEFAULT_CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Default bound on context transaction attempts.
pub const DEFAULT_MAX_TRANSACTION_ATTEMPTS: usize = 10;

/// Settings shared by every call running on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// How long a callee keeps an opened stream waiting for `Start`.
    pub stream_start_timeout: Duration,
    /// How long a finished stream keeps its reference to absorb the peer's
    /// trailing `Close` or in-flight `Data` frames.
    pub close_linger: Duration,
    /// Maximum attempts of one context transaction before giving up.
    pub max_transaction_attempts: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            stream_start_timeout: DEFAULT_STREAM_START_TIMEOUT,
            close_linger: DEFAULT_CLOSE_LINGER,
            max_transaction_attempts: DEFAULT_MAX_TRANSACTION_ATTEMPTS,
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream_start_timeout(mut self, timeout: Duration) -> Self {
        self.stream_start_timeout = timeout;
        self
    }

    pub fn with_close_linger(mut self, linger: Duration) -> Self {
        self.close_linger = linger;
        self
    }

    pub fn with_max_transaction_attempts(mut self, attempts: usize) -> Self {
        self.max_transaction_attempts = attempts.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.stream_start_timeout, Duration::from_secs(60));
        assert_eq!(config.close_linger, Duration::from_secs(2));
        assert_eq!(config.max_transaction_attempts, 10);
    }

    #[test]
    fn test_builders() {
        let config = NodeConfig::new()
            .with_stream_start_timeout(Duration::from_millis(500))
            .with_close_linger(Duration::ZERO)
            .with_max_transaction_attempts(0);
        assert_eq!(config.stream_start_timeout, Duration::from_millis(500));
        assert_eq!(config.close_linger, Duration::ZERO);
        assert_eq!(config.max_transaction_attempts, 1);
    }
}
