use std::process::ExitCode;

use clap::Parser;

mod alerts;
mod app;
mod control;
mod live;
mod telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = app::Cli::parse();
    app::run(cli).await
}
