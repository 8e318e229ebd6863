use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use arch_engine::Orchestrator;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::debug;

use crate::response_helpers::{cors_preflight, json_error};
use crate::routes::{generate, health, status};
use crate::websocket::Endpoint;

/// Shared state handed to every request.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

pub async fn handle_request(
    req: Request<Body>,
    state: AppState,
) -> Result<Response<Body>, Infallible> {
    debug!("[HTTP] {} {}", req.method(), req.uri());

    if req.method() == Method::GET {
        if let Some(endpoint) = Endpoint::from_path(req.uri().path()) {
            return generate::handle_pipeline_websocket(req, endpoint, state.orchestrator).await;
        }
    }

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => health::handle().await,
        (&Method::GET, "/api/status") => status::handle(state.orchestrator).await,
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
    }
}

/// Bind `addr` and return the bound address plus the server future, which
/// runs until `shutdown` resolves.
pub fn bind<F>(
    addr: SocketAddr,
    state: AppState,
    shutdown: F,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>>), hyper::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone())))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    Ok((local_addr, server.with_graceful_shutdown(shutdown)))
}
