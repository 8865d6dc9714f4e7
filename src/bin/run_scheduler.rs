use std::{env, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stratagem::{
    agents::{Agent, OrchestratorAgent, SchedulerAgent, SchedulerConfig},
    db::{CandleStore, StoreMode},
    llm::{GroqClient, LlmClient},
    market::BinanceFuturesSource,
    strategy::StrategyRegistry,
};

/// Run the continuous qualification loop for one strategy and symbol.
#[derive(Parser, Debug)]
#[command(name = "run_scheduler", version, about)]
struct Args {
    /// Trading symbol, e.g. BTCUSDT.
    #[arg(long)]
    symbol: String,

    /// Strategy name registered in the factory registry.
    #[arg(long, default_value = "carga_descarga")]
    strategy: String,

    /// Seconds between qualification cycles (60..=86400).
    #[arg(long, default_value_t = 3600)]
    interval: u64,

    /// Qualification periods in days.
    #[arg(long, default_value = "1,7,30,90", value_delimiter = ',')]
    periods: Vec<u32>,

    /// Backtests per period.
    #[arg(long, default_value_t = 10)]
    backtests_per_period: u32,

    /// Minimum passing backtests per period.
    #[arg(long, default_value_t = 10)]
    min_passed: u32,

    /// Maximum window overlap percentage per parameter family.
    #[arg(long, default_value_t = 20.0)]
    max_overlap: f64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "scheduler failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = PathBuf::from(env::var("STRATAGEM_DATA_DIR").unwrap_or_else(|_| "data".into()));
    std::fs::create_dir_all(&data_dir)?;

    let llm: Option<Arc<dyn LlmClient>> = match GroqClient::from_env() {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(reason = %e, "running without LLM optimization");
            None
        }
    };

    let store = CandleStore::connect(data_dir.join("candles.db"), StoreMode::Backtest).await?;
    let orchestrator = Arc::new(OrchestratorAgent::new(
        None,
        store,
        Arc::new(BinanceFuturesSource::new()),
        Arc::new(StrategyRegistry::with_defaults()),
        llm,
        Some(data_dir.join("registry")),
    )?);

    let mut config = SchedulerConfig::new(&args.symbol, &args.strategy);
    config.schedule_interval_seconds = args.interval;
    config.incremental_periods = args.periods;
    config.backtests_per_period = args.backtests_per_period;
    config.min_passed_backtests_per_period = args.min_passed;
    config.max_overlap_percentage = args.max_overlap;

    let scheduler = Arc::new(SchedulerAgent::new(None, config, orchestrator)?);
    scheduler.initialize().await?;

    // Ctrl-C requests a cooperative stop: the current cycle completes.
    let stopper = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping scheduler");
            stopper.stop();
        }
    });

    scheduler.start().await?;
    scheduler.close().await;

    Ok(())
}
