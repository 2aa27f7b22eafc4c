mod config;
mod gemini;
mod model;
mod models;
mod pipeline;
mod planner;
mod prompt;
mod routes;
#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::gemini::GeminiClient;
use crate::pipeline::PredictionPipeline;
use crate::routes::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env();
    if config.is_demo() {
        tracing::warn!("GEMINI_API_KEY not set; running in demo mode with placeholder images");
    } else {
        tracing::info!("Using API key: {}...", config.api_key.chars().take(6).collect::<String>());
    }
    tracing::info!(planner = %config.planner_model, render = %config.render_model, "Model configuration");

    let gemini = GeminiClient::new(&config)?;
    let state = AppState {
        cases: Arc::default(),
        pipeline: Arc::new(PredictionPipeline::new(Arc::new(gemini), config.render.clone())),
    };

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
