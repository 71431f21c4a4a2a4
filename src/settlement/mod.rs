// Netting, orchestration and scheduling of fee settlements
pub mod concurrency;
pub mod netting;
pub mod orchestrator;
pub mod scheduler;

pub use concurrency::{ConcurrencyGovernor, FanOut};
pub use netting::{NetObligation, NettingEngine};
pub use orchestrator::{CycleReport, OrchestratorConfig, Phase, SettlementOrchestrator};
pub use scheduler::{PhaseSchedule, ScheduleConfig, SettlementScheduler};
