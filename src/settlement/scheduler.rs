use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::settlement::sweeps::SettlementSweeps;

// Guard against a mis-set env var hammering the database.
const MIN_SWEEP_INTERVAL_SECS: u64 = 30;

/// Background driver for the settlement sweeps. Each tick runs the
/// auto-release pass then the expiry pass; a failed cycle is logged and the
/// loop keeps going.
pub struct SweepScheduler {
    interval_secs: u64,
    sweeps: Arc<SettlementSweeps>,
}

impl SweepScheduler {
    pub fn new(interval_secs: u64, sweeps: Arc<SettlementSweeps>) -> Self {
        Self {
            interval_secs,
            sweeps,
        }
    }

    /// Start the sweep loop (runs in background).
    pub fn start(&self) -> JoinHandle<()> {
        let sweeps = self.sweeps.clone();
        let period = effective_interval(self.interval_secs);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // Skip missed ticks instead of bursting after a slow cycle.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                info!("🔄 Starting settlement cycle");

                if let Err(e) = sweeps.run_auto_release().await {
                    error!("❌ Auto-release sweep failed: {:?}", e);
                }

                if let Err(e) = sweeps.run_expiry().await {
                    error!("❌ Expiry sweep failed: {:?}", e);
                }

                info!("✓ Settlement cycle completed");
            }
        })
    }
}

fn effective_interval(configured_secs: u64) -> Duration {
    Duration::from_secs(configured_secs.max(MIN_SWEEP_INTERVAL_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_interval_clamps_low_values() {
        assert_eq!(effective_interval(0), Duration::from_secs(30));
        assert_eq!(effective_interval(5), Duration::from_secs(30));
        assert_eq!(effective_interval(600), Duration::from_secs(600));
    }
}
