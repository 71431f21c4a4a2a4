use std::{sync::Arc, time::Duration};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;
use crate::{
    api::handler::AppState,
    config::Settings,
    error::AppResult,
    execution::{
        chain::ChainClient,
        evm::EvmRpcClient,
        signing::{RemoteSigner, SigningCoordinator},
    },
    fees::source::LedgerApiClient,
    ledger::{repository::PgSettlementStore, service::SettlementLedger},
    settlement::{orchestrator::SettlementOrchestrator, scheduler::SettlementScheduler},
    wallet::repository::{PgWalletRegistry, WalletRegistry},
};

/// Everything `main` needs to serve and schedule
pub struct Components {
    pub state: AppState,
    pub scheduler: SettlementScheduler,
}

pub async fn initialize(settings: &Settings) -> AppResult<Components> {
    info!("Initializing application components ...");

    // Database pool, sized for every phase running at full concurrency
    let max_connections = settings.jobs.load.max_concurrent_jobs
        + settings.jobs.transact.max_concurrent_jobs
        + settings.jobs.post.max_concurrent_jobs
        + 5;
    let pool = initialize_database(&settings.database_url, max_connections as u32).await?;

    // Core components
    let ledger = SettlementLedger::new(Arc::new(PgSettlementStore::new(pool.clone())));
    let wallets: Arc<dyn WalletRegistry> = Arc::new(PgWalletRegistry::new(pool));
    info!("✅ Settlement ledger and wallet registry initialized");

    let fees = Arc::new(LedgerApiClient::new(settings.ledger_api_config())?);
    info!("✅ Fee ledger client initialized: {}", settings.ledger_api.url);

    let chain: Arc<dyn ChainClient> = Arc::new(EvmRpcClient::new(settings.evm_config())?);
    info!(
        "✅ Chain client initialized: {} (chain id {})",
        settings.chain.network, settings.chain.chain_id
    );

    let signer = Arc::new(RemoteSigner::new(settings.signer_config())?);
    let signing = SigningCoordinator::new(signer, chain.clone(), settings.signer.party_prefix.clone());
    info!("✅ Signing coordinator initialized: {}", settings.signer.url);

    let orchestrator = Arc::new(SettlementOrchestrator::new(
        wallets.clone(),
        fees,
        ledger.clone(),
        chain.clone(),
        signing,
        settings.orchestrator_config(),
    ));
    let scheduler = SettlementScheduler::new(settings.schedule_config(), orchestrator);
    info!("✅ Settlement orchestrator initialized");

    let state = AppState {
        ledger,
        wallets,
        chain,
    };

    Ok(Components { state, scheduler })
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
