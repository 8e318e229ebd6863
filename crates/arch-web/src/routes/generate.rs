use std::convert::Infallible;
use std::sync::Arc;

use arch_engine::{Orchestrator, SessionKey};
use hyper::{Body, Request, Response, StatusCode};
use log::error;

use crate::request_parsing::get_query_param;
use crate::response_helpers::json_error;
use crate::websocket::{handle_pipeline_ws, Endpoint};
use crate::websocket_utils::{
    build_websocket_upgrade_response, calculate_websocket_accept_key, get_websocket_key,
    is_websocket_upgrade,
};

/// WebSocket upgrade handler for the pipeline endpoints.
///
/// `?session=<id>` selects the reconstruction cache partition; without it
/// the process-wide default slot is used.
pub async fn handle_pipeline_websocket(
    req: Request<Body>,
    endpoint: Endpoint,
    orchestrator: Arc<Orchestrator>,
) -> Result<Response<Body>, Infallible> {
    if !is_websocket_upgrade(&req) {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "WebSocket upgrade required",
        ));
    }
    let Some(key) = get_websocket_key(&req) else {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "Missing Sec-WebSocket-Key header",
        ));
    };
    let accept_key = calculate_websocket_accept_key(&key);
    let session = SessionKey::from_client(get_query_param(req.uri(), "session").as_deref());

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = handle_pipeline_ws(upgraded, endpoint, session, orchestrator).await {
                    error!("[WS ERROR] {} {}", endpoint.path(), e);
                }
            }
            Err(e) => {
                error!("[WS UPGRADE ERROR] {} {}", endpoint.path(), e);
            }
        }
    });

    Ok(build_websocket_upgrade_response(&accept_key))
}
