//! Configuration for the sync engine.

use crate::backoff::RetryConfig;
use std::time::Duration;

/// Configuration shared by a location synchronizer and its databases.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Lifetime requested for outgoing subscriptions.
    pub subscription_ttl: Duration,
    /// How far ahead of expiry an outgoing subscription is renewed.
    pub resubscribe_margin: Duration,
    /// Ceiling on the lifetime granted to incoming subscribers.
    pub incoming_ttl_cap: Duration,
    /// Maximum databases per list payload.
    pub list_batch: usize,
    /// Maximum entries per database payload.
    pub entry_batch: usize,
    /// Maximum entry bodies per data-get request.
    pub data_batch: usize,
    /// Retry behavior for remote subscribes and data-gets.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            subscription_ttl: Duration::from_secs(600),
            resubscribe_margin: Duration::from_secs(60),
            incoming_ttl_cap: Duration::from_secs(3600),
            list_batch: 100,
            entry_batch: 100,
            data_batch: 20,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the outgoing subscription lifetime.
    pub fn with_subscription_ttl(mut self, ttl: Duration) -> Self {
        self.subscription_ttl = ttl;
        self
    }

    /// Sets the renewal margin.
    pub fn with_resubscribe_margin(mut self, margin: Duration) -> Self {
        self.resubscribe_margin = margin;
        self
    }

    /// Sets the incoming-subscription lifetime ceiling.
    pub fn with_incoming_ttl_cap(mut self, cap: Duration) -> Self {
        self.incoming_ttl_cap = cap;
        self
    }

    /// Sets the list payload batch size.
    pub fn with_list_batch(mut self, batch: usize) -> Self {
        self.list_batch = batch;
        self
    }

    /// Sets the entry payload batch size.
    pub fn with_entry_batch(mut self, batch: usize) -> Self {
        self.entry_batch = batch;
        self
    }

    /// Sets the data-get batch size.
    pub fn with_data_batch(mut self, batch: usize) -> Self {
        self.data_batch = batch;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chains() {
        let config = SyncConfig::new()
            .with_subscription_ttl(Duration::from_secs(30))
            .with_list_batch(5)
            .with_data_batch(2)
            .with_retry(RetryConfig::new(1));

        assert_eq!(config.subscription_ttl, Duration::from_secs(30));
        assert_eq!(config.list_batch, 5);
        assert_eq!(config.data_batch, 2);
        assert_eq!(config.retry.max_attempts, 1);
    }
}
