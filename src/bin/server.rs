use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use streamload::{Config, Server};

#[derive(Parser)]
#[command(name = "streamload-server")]
#[command(about = "Accept shaped QUIC or TLS/TCP streams and log every read", long_about = None)]
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

    let server = Server::new(config)?.with_quiet(cli.quiet);

    let cancel = server.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            cancel.cancel();
        }
    });

    let report = server.run().await?;
    info!(
        "{} of {} streams received in {:.3} s",
        report.completed(),
        report.completed() + report.failed(),
        report.elapsed.as_secs_f64()
    );
    report.into_result()?;
    Ok(())
}
