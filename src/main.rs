//! Supervisor entry point.
//!
//! Preset selection is a CLI flag, not an interactive menu or a YAML/JSON
//! preset file — both are explicitly out of scope for the core. The
//! channel set and symbol list come straight from arguments/environment.

use std::collections::HashSet;

use clap::{Parser, ValueEnum};
use marketfeed_ingest::config::{Config, Preset};
use marketfeed_ingest::model::Channel;
use marketfeed_ingest::supervisor::Supervisor;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkArg {
    Columnar,
    Cache,
    Both,
}

#[derive(Debug, Parser)]
#[command(name = "marketfeed-ingest", about = "Market-data ingestion supervisor")]
struct Args {
    /// Preset label, surfaced in every log line.
    #[arg(long, default_value = "default")]
    preset: String,

    /// Comma-separated instrument symbols, e.g. BTCUSDT,ETHUSDT.
    #[arg(long, env = "INGEST_SYMBOLS", value_delimiter = ',')]
    symbols: Vec<String>,

    /// Canonical channels to ingest for this preset.
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = default_channels())]
    channels: Vec<ChannelArg>,

    /// Explicitly enable the order-book diff channel; never inferred
    /// from other channel selections.
    #[arg(long, default_value_t = false)]
    enable_diff_orderbook: bool,

    /// Which sinks this process writes to.
    #[arg(long, value_enum, default_value = "both")]
    sink: SinkArg,

    /// CPU core index to pin this process to, if any.
    #[arg(long)]
    cpu: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Hash)]
enum ChannelArg {
    Trades,
    AggTrades5s,
    L1,
    ObDiff,
    Liquidations,
    Klines,
    MarkPrice,
    Funding,
}

impl From<ChannelArg> for Channel {
    fn from(c: ChannelArg) -> Self {
        match c {
            ChannelArg::Trades => Channel::Trades,
            ChannelArg::AggTrades5s => Channel::AggTrades5s,
            ChannelArg::L1 => Channel::L1,
            ChannelArg::ObDiff => Channel::ObDiff,
            ChannelArg::Liquidations => Channel::Liquidations,
            ChannelArg::Klines => Channel::Klines,
            ChannelArg::MarkPrice => Channel::MarkPrice,
            ChannelArg::Funding => Channel::Funding,
        }
    }
}

fn default_channels() -> Vec<ChannelArg> {
    vec![
        ChannelArg::Trades,
        ChannelArg::AggTrades5s,
        ChannelArg::L1,
        ChannelArg::Klines,
        ChannelArg::MarkPrice,
        ChannelArg::Funding,
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "fatal configuration error, exiting");
            std::process::exit(1);
        }
    };

    let channels: HashSet<Channel> = args.channels.into_iter().map(Channel::from).collect();
    let mut channels: Vec<Channel> = channels.into_iter().collect();
    if args.enable_diff_orderbook && !channels.contains(&Channel::ObDiff) {
        channels.push(Channel::ObDiff);
    }

    let preset = match Preset::new(
        args.preset,
        args.symbols,
        channels,
        args.enable_diff_orderbook,
        args.cpu,
    ) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "fatal preset configuration error, exiting");
            std::process::exit(1);
        }
    };

    info!(preset = %preset.label, symbols = preset.symbols.len(), channels = preset.channels.len(), "starting supervisor");

    let supervisor = Supervisor::new(config, preset);
    if let Err(e) = supervisor.run().await {
        error!(error = %e, "supervisor exited with error");
        std::process::exit(1);
    }

    Ok(())
}
