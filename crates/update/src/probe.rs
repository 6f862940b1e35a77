//! Polling units until they all report running.

use tracing::debug;
use vigil_common::{RetryPolicy, VigilError, VigilResult};

use crate::units::UnitHandle;

#[derive(Debug, Clone, Copy)]
pub struct ServiceProbe {
    policy: RetryPolicy,
}

impl ServiceProbe {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Polls every unit each round, sleeping the policy delay between rounds.
    ///
    /// Returns the round on which all units were running. A status query
    /// that fails counts as not running for that round.
    pub async fn wait_until_running(&self, units: &[UnitHandle]) -> VigilResult<u32> {
        let max = self.policy.max_attempts();
        let mut round = 1;
        loop {
            let mut stragglers = Vec::new();
            for unit in units {
                match unit.is_running().await {
                    Ok(true) => {}
                    Ok(false) => stragglers.push(unit.name().to_string()),
                    Err(e) => {
                        debug!("status query for {} failed: {}", unit.name(), e);
                        stragglers.push(unit.name().to_string());
                    }
                }
            }

            if stragglers.is_empty() {
                debug!("all {} units running after {} probes", units.len(), round);
                return Ok(round);
            }
            if round >= max {
                return Err(VigilError::UnitsNotRunning {
                    units: stragglers,
                    attempts: round,
                });
            }
            debug!("probe {}/{}: waiting for {}", round, max, stragglers.join(", "));
            tokio::time::sleep(self.policy.delay).await;
            round += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::units::ControllableUnit;

    /// Reports running from the given poll onwards.
    struct SlowStarter {
        name: &'static str,
        running_from: u32,
        polls: AtomicU32,
    }

    #[async_trait]
    impl ControllableUnit for SlowStarter {
        fn name(&self) -> &str {
            self.name
        }
        async fn start(&self) -> VigilResult<()> {
            Ok(())
        }
        async fn stop(&self) -> VigilResult<()> {
            Ok(())
        }
        async fn is_running(&self) -> VigilResult<bool> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(poll >= self.running_from)
        }
    }

    fn slow(name: &'static str, running_from: u32) -> UnitHandle {
        Arc::new(SlowStarter {
            name,
            running_from,
            polls: AtomicU32::new(0),
        })
    }

    fn probe(attempts: u32) -> ServiceProbe {
        ServiceProbe::new(RetryPolicy::new(attempts, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn waits_for_the_slowest_unit() {
        let units = vec![slow("agent", 1), slow("helper", 3)];
        assert_eq!(probe(5).wait_until_running(&units).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn exhausted_probe_names_stragglers() {
        let units = vec![slow("agent", 1), slow("helper", 10)];
        let err = probe(2).wait_until_running(&units).await.unwrap_err();
        match err {
            VigilError::UnitsNotRunning { units, attempts } => {
                assert_eq!(units, vec!["helper".to_string()]);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
