use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rsibot::api::bybit::{BYBIT_MAINNET_URL, BYBIT_TESTNET_URL};
use rsibot::api::{BybitClient, PaperExchange};
use rsibot::{logging, BotConfig, ExchangeGateway, TradingBot};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Unattended RSI trading loop for Bybit linear perpetuals")]
struct Cli {
    /// TOML config file; RSIBOT_* environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trade against an in-memory paper exchange instead of Bybit
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Starting equity of the paper exchange
    #[arg(long, default_value_t = 10_000.0)]
    paper_equity: f64,

    /// Seed for the paper exchange price walk
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// tracing filter, e.g. "rsibot=debug" (RUST_LOG wins if set)
    #[arg(long)]
    log_filter: Option<String>,

    /// Directory for daily-rotated log files
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Log to stdout only
    #[arg(long, default_value_t = false)]
    no_log_file: bool,

    /// Use the Bybit testnet
    #[arg(long, default_value_t = false)]
    testnet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_dir = (!cli.no_log_file).then_some(cli.log_dir.as_path());
    let _log_guard = logging::init(cli.log_filter.as_deref(), log_dir)?;

    tracing::info!("🚀 rsibot starting");

    let config = BotConfig::load(cli.config.as_deref())?;

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Symbol: {} ({})", config.symbol, config.timeframe);
    tracing::info!("  Position size: {} @ {}x", config.position_size, config.leverage);
    tracing::info!(
        "  RSI({}) thresholds: {} / {}",
        config.rsi_period,
        config.low_threshold,
        config.high_threshold
    );
    tracing::info!(
        "  Stop-loss: {:?} SL {}% / TP {}%",
        config.stop_loss_mode,
        config.stop_loss_coef * 100.0,
        config.take_profit_coef * 100.0
    );
    tracing::info!("  Max drawdown: {}%", config.max_drawdown_pct);

    if cli.dry_run {
        tracing::info!("🧪 Dry run: paper exchange with ${:.2}", cli.paper_equity);
        let exchange = PaperExchange::simulated(
            cli.seed,
            100.0,
            cli.paper_equity,
            config.timeframe,
        );
        run(config, exchange).await
    } else {
        let api_key = std::env::var("BYBIT_API_KEY").context("BYBIT_API_KEY not found in environment")?;
        let api_secret =
            std::env::var("BYBIT_API_SECRET").context("BYBIT_API_SECRET not found in environment")?;
        let base_url = if cli.testnet {
            BYBIT_TESTNET_URL
        } else {
            BYBIT_MAINNET_URL
        };
        tracing::info!("🔌 Bybit REST at {}", base_url);
        let client = BybitClient::new(api_key, api_secret, base_url)?;
        run(config, client).await
    }
}

async fn run<G: ExchangeGateway + 'static>(config: BotConfig, gateway: G) -> anyhow::Result<()> {
    let handle = TradingBot::new(config, gateway)?.start();

    tracing::info!("\nPress Ctrl+C to stop...\n");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");

    if let Some(bot) = handle.stop().await {
        let drawdown = bot.drawdown();
        tracing::info!(
            "Final equity ${:.2} (drawdown {:.2}%, breaker {})",
            drawdown.current_equity,
            drawdown.drawdown_pct,
            if drawdown.tripped { "tripped" } else { "armed" }
        );
        if let Some(position) = bot.position() {
            tracing::warn!(
                "Position {} is still open on the venue",
                position.order.order_id
            );
        }
    }

    tracing::info!("👋 rsibot stopped");
    Ok(())
}
