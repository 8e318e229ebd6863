// Pipeline status snapshot: slots, occupant, cache sessions, open channels

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arch_engine::{Orchestrator, OrchestratorStatus};
use hyper::{Body, Response, StatusCode};
use serde::Serialize;

use crate::response_helpers::json_response;
use crate::websocket::ACTIVE_WS_CONNECTIONS;

#[derive(Serialize)]
struct StatusBody {
    #[serde(flatten)]
    pipeline: OrchestratorStatus,
    active_connections: u32,
}

pub async fn handle(orchestrator: Arc<Orchestrator>) -> Result<Response<Body>, Infallible> {
    let body = StatusBody {
        pipeline: orchestrator.status(),
        active_connections: ACTIVE_WS_CONNECTIONS.load(Ordering::SeqCst),
    };
    Ok(json_response(StatusCode::OK, &body))
}
