//! service-fetcher - host or call the sample calculator service over a Unix
//! socket.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::runtime::Handle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use service_fetcher::calculator::{Calculator, CalculatorProxy, CalculatorService, LocalCalculator};
use service_fetcher::ipc::{server, UnixTransport};
use service_fetcher::{ConnectionManager, FetcherConfig};

#[derive(Parser, Debug)]
#[command(name = "service-fetcher")]
#[command(about = "Typed calls to an out-of-process calculator service", version)]
struct Args {
    /// Socket path (overrides SERVICE_FETCHER_SOCKET)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the calculator service until interrupted
    Serve,
    /// Call one calculator method and print the result
    Call {
        op: Op,
        a: i64,
        b: i64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Op {
    Plus,
    Minus,
    Multi,
    Divide,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so `call` output stays clean.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "service_fetcher=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = FetcherConfig::from_env().context("Invalid configuration")?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    match args.command {
        Command::Serve => serve(&config).await,
        Command::Call { op, a, b } => {
            let result = call(&config, op, a, b).await?;
            println!("{}", result);
            Ok(())
        }
    }
}

async fn serve(config: &FetcherConfig) -> Result<()> {
    info!("Starting service-fetcher v{}", env!("CARGO_PKG_VERSION"));
    let server = server::spawn(
        config.socket_path.clone(),
        CalculatorService::new(LocalCalculator),
    )?;
    info!(socket = %server.path().display(), "calculator service listening");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    server.shutdown().await;
    Ok(())
}

async fn call(config: &FetcherConfig, op: Op, a: i64, b: i64) -> Result<i64> {
    let transport = UnixTransport::from_config(Handle::current(), config);
    let manager = ConnectionManager::new(transport, config.bind_target("calculator"));

    let calculator: CalculatorProxy = manager
        .fetch()
        .await
        .with_context(|| format!("Could not reach {}", manager.target()))?;

    let result = match op {
        Op::Plus => calculator.plus(a, b).await,
        Op::Minus => calculator.minus(a, b).await,
        Op::Multi => calculator.multi(a, b).await,
        Op::Divide => calculator.divide(a, b).await,
    };
    manager.release();
    Ok(result?)
}
