use std::{env, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use chrono::Utc;

use stratagem::{
    agents::{Agent, OrchestratorAgent, StartBacktestRequest},
    db::{CandleStore, StoreMode},
    market::BinanceFuturesSource,
    strategy::StrategyRegistry,
};

/// Run a single backtest and print its result as JSON.
#[derive(Parser, Debug)]
#[command(name = "run_backtest", version, about)]
struct Args {
    /// Trading symbol, e.g. BTCUSDT.
    #[arg(long)]
    symbol: String,

    /// Strategy name registered in the factory registry.
    #[arg(long, default_value = "carga_descarga")]
    strategy: String,

    /// Backtest window length in days, ending one minute before now.
    #[arg(long, default_value_t = 7)]
    days: u32,

    /// Comma-separated timeframes (2-4 of: 1m 3m 5m 15m 30m 1h 2h 4h 8h 1d 1w 1M).
    #[arg(long, default_value = "1m,15m,1h", value_delimiter = ',')]
    timeframes: Vec<String>,

    /// RSI limits as three ascending integers, e.g. 15,50,85.
    #[arg(long, value_delimiter = ',')]
    rsi_limits: Option<Vec<i64>>,

    /// Initial balance.
    #[arg(long, default_value = "2500")]
    initial_balance: String,

    /// Leverage.
    #[arg(long, default_value = "100")]
    leverage: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "backtest failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = PathBuf::from(env::var("STRATAGEM_DATA_DIR").unwrap_or_else(|_| "data".into()));
    std::fs::create_dir_all(&data_dir)?;

    let store = CandleStore::connect(data_dir.join("candles.db"), StoreMode::Backtest).await?;
    let orchestrator = OrchestratorAgent::new(
        None,
        store,
        Arc::new(BinanceFuturesSource::new()),
        Arc::new(StrategyRegistry::with_defaults()),
        None,
        Some(data_dir.join("registry")),
    )?;
    orchestrator.initialize().await?;

    let now = Utc::now().timestamp_millis();
    let end_time = now - 60_000;
    let start_time = end_time - args.days as i64 * 86_400_000;

    let mut request = StartBacktestRequest::new(&args.symbol, start_time);
    request.end_time = Some(end_time);
    request.strategy_name = args.strategy;
    request.initial_balance = args.initial_balance.parse()?;
    request.leverage = args.leverage.parse()?;
    request.rsi_limits = args.rsi_limits;
    request.timeframes = args
        .timeframes
        .iter()
        .map(|tf| tf.parse())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("invalid timeframes: {:?}", args.timeframes))?;

    let response = orchestrator.run_backtest(request).await?;
    println!("{}", serde_json::to_string_pretty(&response.results)?);

    orchestrator.close().await;
    Ok(())
}
