//! HTTP + WebSocket front end for the pipeline orchestrator.

pub mod request_parsing;
pub mod response_helpers;
pub mod routes;
pub mod server;
pub mod websocket;
pub mod websocket_utils;

pub use server::{bind, handle_request, AppState};
pub use websocket::{Endpoint, ACTIVE_WS_CONNECTIONS};
