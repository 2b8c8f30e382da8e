use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use qpy_server::app::App;
use qpy_server::settings::Settings;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Application server for sandboxed question packages")]
struct Args {
    /// Path to the INI configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.general.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let app = App::new(settings).await.context("assembling the server")?;
    app.serve().await.context("running the server")
}
