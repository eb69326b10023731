use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use streamload::{Client, Config};

#[derive(Parser)]
#[command(name = "streamload-client")]
#[command(about = "Open shaped QUIC or TLS/TCP streams and log every write", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON configuration file
    config: PathBuf,

    /// Override the directory receiving the per-stream logs
    #[arg(short, long)]
    log_dir: Option<PathBuf>,

    /// Do not print per-stream summaries
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(dir) = cli.log_dir {
        config = config.with_log_dir(dir);
    }

    let client = Client::new(config)?.with_quiet(cli.quiet);

    let cancel = client.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling all streams");
            cancel.cancel();
        }
    });

    let report = client.run().await?;
    info!(
        "{} of {} streams completed in {:.3} s",
        report.completed(),
        report.completed() + report.failed(),
        report.elapsed.as_secs_f64()
    );
    report.into_result()?;
    Ok(())
}
