use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::execution::evm::EvmConfig;
use crate::execution::signing::SignerConfig;
use crate::fees::source::LedgerApiConfig;
use crate::settlement::orchestrator::OrchestratorConfig;
use crate::settlement::scheduler::{PhaseSchedule, ScheduleConfig};

const MAX_CONCURRENT_JOBS: usize = 100;

/// Worker settings: defaults, then an optional `config.toml` (stem overridden
/// by `FEE_CONFIG_NAME`), then `FEE__`-prefixed environment variables with
/// `__` as the nesting separator, e.g. `FEE__JOBS__LOAD__INTERVAL_SECS`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    pub bind_address: String,
    pub ledger_api: LedgerApiSettings,
    pub signer: SignerSettings,
    pub chain: ChainSettings,
    pub fees: FeeSettings,
    pub jobs: JobsSettings,
    pub cycle_deadline_secs: u64,
    /// Claims older than this are returned to Draft before each transact cycle
    pub stale_claim_secs: Option<u64>,
    /// Transact right after a wallet's load instead of waiting for the transact schedule
    pub transact_on_load: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerApiSettings {
    pub url: String,
    pub token: String,
    pub timeout_secs: u64,
    pub requests_per_second: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignerSettings {
    pub url: String,
    pub token: String,
    pub timeout_secs: u64,
    /// Keysign session ids are `{party_prefix}-{run_id}`
    pub party_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChainSettings {
    pub rpc_url: String,
    pub chain_id: u64,
    pub network: String,
    pub gas_limit: Option<u64>,
    pub request_timeout_secs: u64,
    pub receipt_poll_ms: u64,
    pub receipt_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeeSettings {
    pub treasury_address: String,
    pub token_contract: String,
    /// Smallest token unit; larger nets are refused
    pub max_fee_amount: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct JobsSettings {
    pub load: LoadJobSettings,
    pub transact: TransactJobSettings,
    pub post: PostJobSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoadJobSettings {
    pub interval_secs: u64,
    /// Run once a day at this UTC hour instead of on the interval
    pub daily_at_hour: Option<u32>,
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransactJobSettings {
    pub interval_secs: u64,
    pub daily_at_hour: Option<u32>,
    pub max_concurrent_jobs: usize,
    /// Block on the receipt after broadcasting
    pub wait_mined: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PostJobSettings {
    pub interval_secs: u64,
    pub daily_at_hour: Option<u32>,
    pub max_concurrent_jobs: usize,
    pub success_confirmations: u64,
}

// ========== DEFAULTS ==========

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/fee_settlement".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
            ledger_api: LedgerApiSettings::default(),
            signer: SignerSettings::default(),
            chain: ChainSettings::default(),
            fees: FeeSettings::default(),
            jobs: JobsSettings::default(),
            cycle_deadline_secs: 600,
            stale_claim_secs: None,
            transact_on_load: false,
        }
    }
}

impl Default for LedgerApiSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8081".to_string(),
            token: String::new(),
            timeout_secs: 30,
            requests_per_second: 20,
        }
    }
}

impl Default for SignerSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8082".to_string(),
            token: String::new(),
            timeout_secs: 120,
            party_prefix: "fee-settlement".to_string(),
        }
    }
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            chain_id: 1,
            network: "ethereum".to_string(),
            gas_limit: None,
            request_timeout_secs: 15,
            receipt_poll_ms: 3_000,
            receipt_timeout_secs: 180,
        }
    }
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            treasury_address: String::new(),
            token_contract: String::new(),
            // 500 USDC
            max_fee_amount: 500_000_000,
        }
    }
}

impl Default for LoadJobSettings {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            daily_at_hour: None,
            max_concurrent_jobs: 10,
        }
    }
}

impl Default for TransactJobSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            daily_at_hour: None,
            max_concurrent_jobs: 10,
            wait_mined: false,
        }
    }
}

impl Default for PostJobSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            daily_at_hour: None,
            max_concurrent_jobs: 10,
            success_confirmations: 20,
        }
    }
}

// ========== LOADING ==========

impl Settings {
    pub fn load() -> AppResult<Self> {
        let name = std::env::var("FEE_CONFIG_NAME").unwrap_or_else(|_| "config".to_string());

        let settings: Settings = Config::builder()
            .add_source(File::with_name(&name).required(false))
            .add_source(
                Environment::with_prefix("FEE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML document without consulting the environment
    pub fn from_toml(document: &str) -> AppResult<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(document, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.ledger_api.token.is_empty() {
            return Err(AppError::Config("ledger_api.token is required".into()));
        }
        if self.chain.rpc_url.is_empty() {
            return Err(AppError::Config("chain.rpc_url is required".into()));
        }
        if self.fees.treasury_address.is_empty() {
            return Err(AppError::Config("fees.treasury_address is required".into()));
        }
        if self.fees.token_contract.is_empty() {
            return Err(AppError::Config("fees.token_contract is required".into()));
        }

        let jobs = [
            ("load", self.jobs.load.interval_secs, self.jobs.load.daily_at_hour, self.jobs.load.max_concurrent_jobs),
            (
                "transact",
                self.jobs.transact.interval_secs,
                self.jobs.transact.daily_at_hour,
                self.jobs.transact.max_concurrent_jobs,
            ),
            ("post", self.jobs.post.interval_secs, self.jobs.post.daily_at_hour, self.jobs.post.max_concurrent_jobs),
        ];
        for (name, interval_secs, daily_at_hour, max_concurrent_jobs) in jobs {
            if !(1..=MAX_CONCURRENT_JOBS).contains(&max_concurrent_jobs) {
                return Err(AppError::Config(format!(
                    "jobs.{}.max_concurrent_jobs must be between 1 and {}, got {}",
                    name, MAX_CONCURRENT_JOBS, max_concurrent_jobs
                )));
            }
            if interval_secs == 0 {
                return Err(AppError::Config(format!("jobs.{}.interval_secs must be positive", name)));
            }
            if let Some(hour) = daily_at_hour {
                if hour > 23 {
                    return Err(AppError::Config(format!(
                        "jobs.{}.daily_at_hour must be 0-23, got {}",
                        name, hour
                    )));
                }
            }
        }

        if self.cycle_deadline_secs == 0 {
            return Err(AppError::Config("cycle_deadline_secs must be positive".into()));
        }
        if self.stale_claim_secs == Some(0) {
            return Err(AppError::Config("stale_claim_secs must be positive when set".into()));
        }

        Ok(())
    }

    // ========== COMPONENT CONFIGS ==========

    pub fn ledger_api_config(&self) -> LedgerApiConfig {
        LedgerApiConfig {
            base_url: self.ledger_api.url.clone(),
            token: self.ledger_api.token.clone(),
            timeout: Duration::from_secs(self.ledger_api.timeout_secs),
            requests_per_second: self.ledger_api.requests_per_second,
        }
    }

    pub fn signer_config(&self) -> SignerConfig {
        SignerConfig {
            url: self.signer.url.clone(),
            token: self.signer.token.clone(),
            timeout: Duration::from_secs(self.signer.timeout_secs),
        }
    }

    pub fn evm_config(&self) -> EvmConfig {
        EvmConfig {
            rpc_url: self.chain.rpc_url.clone(),
            chain_id: self.chain.chain_id,
            network: self.chain.network.clone(),
            gas_limit: self.chain.gas_limit,
            request_timeout: Duration::from_secs(self.chain.request_timeout_secs),
            receipt_poll: Duration::from_millis(self.chain.receipt_poll_ms),
            receipt_timeout: Duration::from_secs(self.chain.receipt_timeout_secs),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            treasury_address: self.fees.treasury_address.clone(),
            token_contract: self.fees.token_contract.clone(),
            max_fee_amount: self.fees.max_fee_amount,
            load_concurrency: self.jobs.load.max_concurrent_jobs,
            transact_concurrency: self.jobs.transact.max_concurrent_jobs,
            post_concurrency: self.jobs.post.max_concurrent_jobs,
            wait_mined: self.jobs.transact.wait_mined,
            success_confirmations: self.jobs.post.success_confirmations,
            cycle_deadline: Duration::from_secs(self.cycle_deadline_secs),
            stale_claim_after: self.stale_claim_secs.map(Duration::from_secs),
            transact_on_load: self.transact_on_load,
        }
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            load: phase_schedule(self.jobs.load.interval_secs, self.jobs.load.daily_at_hour),
            transact: phase_schedule(self.jobs.transact.interval_secs, self.jobs.transact.daily_at_hour),
            post: phase_schedule(self.jobs.post.interval_secs, self.jobs.post.daily_at_hour),
        }
    }
}

fn phase_schedule(interval_secs: u64, daily_at_hour: Option<u32>) -> PhaseSchedule {
    match daily_at_hour {
        Some(hour) => PhaseSchedule::DailyAt { hour },
        None => PhaseSchedule::Interval(Duration::from_secs(interval_secs)),
    }
}
