use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use animate_rs_core::{PipelineCell, Runner, Settings};
use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod routes;

use routes::AppContext;

#[derive(Parser)]
#[command(author, version, about = "HTTP API around the AnimateDiff-Lightning pipeline")]
struct Args {
    /// Bind address, overriding $BIND_ADDR.
    #[arg(long)]
    bind: Option<String>,

    /// Defer pipeline construction to the first request instead of loading
    /// eagerly at startup.
    #[arg(long)]
    lazy_load: bool,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let settings = Settings::from_env();
    std::fs::create_dir_all(&settings.outputs_dir)?;
    std::fs::create_dir_all(&settings.inputs_dir)?;
    let bind = args.bind.unwrap_or_else(|| settings.bind_addr.clone());

    let cell = Arc::new(PipelineCell::new());
    let runner = Runner::new(&settings, cell.clone());
    if !args.lazy_load {
        let config = settings.pipeline_config();
        cell.get_or_load(&config)
            .context("failed to load the pipeline at startup")?;
    }

    let ctx = web::Data::new(AppContext {
        settings,
        runner,
        cell,
    });

    info!("starting api on http://{bind}");
    HttpServer::new(move || App::new().app_data(ctx.clone()).configure(routes::routes))
        .bind(&bind)?
        .run()
        .await?;
    Ok(())
}
