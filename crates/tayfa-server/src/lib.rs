//! Thin REST + SSE adapter over the state model, event bus, and scheduler.

mod http;

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tayfa_bus::{AgentStreamBus, BoardBus};
use tayfa_scheduler::Scheduler;
use tayfa_state::StateModel;

pub use http::app_router;

#[derive(Clone)]
pub struct AppState {
    pub state: StateModel,
    pub scheduler: Scheduler,
    pub board_bus: BoardBus,
    pub agent_bus: AgentStreamBus,
    pub started_at: DateTime<Utc>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(state: StateModel, scheduler: Scheduler, board_bus: BoardBus, agent_bus: AgentStreamBus) -> Self {
        Self {
            state,
            scheduler,
            board_bus,
            agent_bus,
            started_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Binds `addr` and serves the HTTP surface until the process receives ctrl-c.
pub async fn serve(addr: SocketAddr, app_state: AppState) -> anyhow::Result<()> {
    let app = app_router(app_state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tayfa-engine listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
