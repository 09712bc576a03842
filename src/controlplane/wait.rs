//! Condition Waiter
//!
//! Polls the storage controller until a predicate over a resource's
//! placements holds. Polling is the only suspension point of a reconciler
//! operation and is always bounded by a deadline.

use crate::domain::ports::{Resource, StorageClient};
use crate::error::{Error, Result, ResultExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Shortest delay between two polls
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Timing of the poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Deadline for the condition to hold
    pub timeout: Duration,
    /// Delay between polls
    pub interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(1),
        }
    }
}

impl WaitConfig {
    /// Reject timings that would never poll or never finish
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::Configuration("wait timeout must be non-zero".into()));
        }
        if self.interval.is_zero() {
            return Err(Error::Configuration("poll interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// The resource is promoted on some node
pub fn any_in_use(resources: &[Resource]) -> bool {
    resources.iter().any(Resource::is_in_use)
}

/// The resource is promoted nowhere
pub fn none_in_use(resources: &[Resource]) -> bool {
    !any_in_use(resources)
}

/// Bounded poll loop over a resource's placements
#[derive(Debug, Clone)]
pub struct ConditionWaiter {
    config: WaitConfig,
    cancel: CancellationToken,
}

impl ConditionWaiter {
    pub fn new(config: WaitConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Poll until `predicate` holds for the placements of `name`
    ///
    /// Fails with `Error::Timeout` when the deadline passes or the token is
    /// cancelled, and with the client's error if a poll fails.
    pub async fn wait_until<F>(
        &self,
        client: &dyn StorageClient,
        name: &str,
        predicate: F,
    ) -> Result<()>
    where
        F: Fn(&[Resource]) -> bool + Send + Sync,
    {
        let poll = async {
            let mut ticker = tokio::time::interval(self.config.interval.max(MIN_POLL_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut polls = 0u32;
            loop {
                ticker.tick().await;
                polls += 1;
                let resources = client
                    .resources(name)
                    .await
                    .context(format!("failed to poll resource {}", name))?;
                if predicate(&resources) {
                    debug!(resource = name, polls, "condition reached");
                    return Ok(());
                }
                trace!(resource = name, polls, "condition not reached yet");
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Timeout {
                resource: name.to_string(),
                reason: "wait cancelled".into(),
            }),
            result = tokio::time::timeout(self.config.timeout, poll) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    resource: name.to_string(),
                    reason: format!("condition not reached within {:?}", self.config.timeout),
                }),
            },
        }
    }
}
