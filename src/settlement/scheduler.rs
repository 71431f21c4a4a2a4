// Settlement Scheduler - drives the load, transact and post phases
//
// Each phase runs on its own loop:
// - Interval: every N seconds, a late tick is skipped rather than bunched up
// - DailyAt: once per day at a UTC hour (off-peak batching of transfers)
//
// Loads run more often than transacts so small fee events accumulate into
// one Draft before a transfer is built for them.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::orchestrator::{CycleReport, Phase, SettlementOrchestrator};
use crate::error::AppResult;

/// When a phase fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSchedule {
    Interval(Duration),
    /// UTC hour, 0-23
    DailyAt { hour: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    pub load: PhaseSchedule,
    pub transact: PhaseSchedule,
    pub post: PhaseSchedule,
}

/// Settlement scheduler - one background loop per phase
pub struct SettlementScheduler {
    config: ScheduleConfig,
    orchestrator: Arc<SettlementOrchestrator>,
}

impl SettlementScheduler {
    pub fn new(config: ScheduleConfig, orchestrator: Arc<SettlementOrchestrator>) -> Self {
        Self { config, orchestrator }
    }

    /// Start the phase loops. They stop once `cancel` fires and the cycle in
    /// progress has returned.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        [
            (Phase::Load, self.config.load),
            (Phase::Transact, self.config.transact),
            (Phase::Post, self.config.post),
        ]
        .into_iter()
        .map(|(phase, schedule)| {
            let orchestrator = self.orchestrator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match schedule {
                    PhaseSchedule::Interval(period) => {
                        Self::run_interval_scheduler(phase, period, &orchestrator, &cancel).await
                    }
                    PhaseSchedule::DailyAt { hour } => {
                        Self::run_daily_scheduler(phase, hour, &orchestrator, &cancel).await
                    }
                }
                info!("🛑 {} scheduler stopped", phase);
            })
        })
        .collect()
    }

    /// Interval scheduler - first cycle fires immediately
    async fn run_interval_scheduler(
        phase: Phase,
        period: Duration,
        orchestrator: &Arc<SettlementOrchestrator>,
        cancel: &CancellationToken,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            Self::run_cycle(phase, orchestrator, cancel).await;
        }
    }

    /// Daily scheduler - runs once per day at the configured hour
    async fn run_daily_scheduler(
        phase: Phase,
        hour: u32,
        orchestrator: &Arc<SettlementOrchestrator>,
        cancel: &CancellationToken,
    ) {
        loop {
            let now = Utc::now();
            let Some(next_execution) = Self::calculate_next_daily_execution(now, hour) else {
                error!("❌ Invalid execution hour {} for {} phase", hour, phase);
                return;
            };
            let wait = (next_execution - now).to_std().unwrap_or_default();

            info!(
                "⏰ Next {} cycle scheduled for: {} UTC",
                phase,
                next_execution.format("%Y-%m-%d %H:%M:%S")
            );

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            Self::run_cycle(phase, orchestrator, cancel).await;
        }
    }

    async fn run_cycle(phase: Phase, orchestrator: &Arc<SettlementOrchestrator>, cancel: &CancellationToken) {
        info!("🔄 Starting {} cycle", phase);

        let result: AppResult<CycleReport> = match phase {
            Phase::Load => orchestrator.run_load_cycle(cancel).await,
            Phase::Transact => orchestrator.run_transact_cycle(cancel).await,
            Phase::Post => orchestrator.run_post_cycle(cancel).await,
        };

        match result {
            Ok(report) if report.failures.is_empty() && report.not_started == 0 => {
                info!("✓ {} cycle completed: {} succeeded", phase, report.succeeded);
            }
            Ok(report) => {
                warn!(
                    "⚠️ {} cycle completed with {} failures, {} not started",
                    phase,
                    report.failures.len(),
                    report.not_started
                );
            }
            Err(e) => error!("❌ {} cycle failed: {:?}", phase, e),
        }
    }

    /// Calculate next daily execution time. `None` for an hour outside 0-23.
    fn calculate_next_daily_execution(now: DateTime<Utc>, execution_hour: u32) -> Option<DateTime<Utc>> {
        let today = Utc.from_utc_datetime(&now.date_naive().and_hms_opt(execution_hour, 0, 0)?);

        // If execution time has passed today, schedule for tomorrow
        if today <= now {
            let tomorrow = (now.date_naive() + chrono::Duration::days(1)).and_hms_opt(execution_hour, 0, 0)?;
            Some(Utc.from_utc_datetime(&tomorrow))
        } else {
            Some(today)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;
    use crate::execution::signing::SigningCoordinator;
    use crate::fees::models::FeeEvent;
    use crate::ledger::memory::MemorySettlementStore;
    use crate::ledger::service::SettlementLedger;
    use crate::ledger::store::SettlementStore;
    use crate::settlement::orchestrator::OrchestratorConfig;
    use crate::testing::*;
    use crate::wallet::repository::{MemoryWalletRegistry, WalletRegistry};

    #[test]
    fn test_calculate_next_daily_execution() {
        // Current time: 2024-01-01 10:00:00 UTC
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        // Execution hour: 14:00 (today)
        let next = SettlementScheduler::calculate_next_daily_execution(now, 14).unwrap();
        assert_eq!(next.hour(), 14);
        assert_eq!(next.day(), 1);

        // Execution hour: 09:00 (already passed, so tomorrow)
        let next = SettlementScheduler::calculate_next_daily_execution(now, 9).unwrap();
        assert_eq!(next.hour(), 9);
        assert_eq!(next.day(), 2);

        // Exactly on the hour counts as passed
        let next = SettlementScheduler::calculate_next_daily_execution(now, 10).unwrap();
        assert_eq!(next.day(), 2);

        assert!(SettlementScheduler::calculate_next_daily_execution(now, 24).is_none());
    }

    #[tokio::test]
    async fn test_interval_phases_settle_and_stop_on_cancel() {
        let store = Arc::new(MemorySettlementStore::new());
        let fees = Arc::new(FakeFeeSource::new());
        let chain = Arc::new(FakeChain::new());
        let wallets = Arc::new(MemoryWalletRegistry::new());
        wallets.register("02a1", WALLET_ADDRESS).await.unwrap();
        fees.add(FeeEvent::debit(1, "02a1", 75));

        let signing = SigningCoordinator::new(Arc::new(FakeSigner::new()), chain.clone(), "test".to_string());
        let orchestrator = Arc::new(SettlementOrchestrator::new(
            wallets,
            fees.clone(),
            SettlementLedger::new(store.clone()),
            chain.clone(),
            signing,
            OrchestratorConfig {
                treasury_address: TREASURY_ADDRESS.to_string(),
                token_contract: TOKEN_CONTRACT.to_string(),
                wait_mined: true,
                ..Default::default()
            },
        ));

        let period = PhaseSchedule::Interval(Duration::from_millis(10));
        let scheduler = SettlementScheduler::new(
            ScheduleConfig {
                load: period,
                transact: period,
                post: period,
            },
            orchestrator,
        );
        let cancel = CancellationToken::new();
        let handles = scheduler.start(cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }

        let runs = store.runs_for_wallet("02a1", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(chain.built_amounts(), vec![75]);
        assert_eq!(chain.sent_count(), 1);
    }
}
