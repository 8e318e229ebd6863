use std::convert::Infallible;
use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info};

use crate::importer::{AssetImporter, ImportError};

fn text_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(body.into())
        .unwrap()
}

/// Write the upload to a kept temporary `.glb` so the host tool can read it
/// after this request returns.
fn stage_upload(bytes: &[u8]) -> Result<PathBuf, ImportError> {
    let mut file = tempfile::Builder::new()
        .prefix("arch-upload-")
        .suffix(".glb")
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|e| ImportError::Io(e.error))?;
    Ok(path)
}

async fn receive_and_import(body: Body, importer: Arc<dyn AssetImporter>) -> Result<(), ImportError> {
    let bytes = hyper::body::to_bytes(body)
        .await
        .map_err(|e| ImportError::Rejected(format!("failed to read upload: {e}")))?;
    info!("[IMPORT] Received {} bytes", bytes.len());
    tokio::task::spawn_blocking(move || {
        let path = stage_upload(&bytes)?;
        importer.import(&path)
    })
    .await
    .map_err(|e| ImportError::Rejected(format!("import task failed: {e}")))?
}

async fn upload(body: Body, importer: Arc<dyn AssetImporter>) -> Response<Body> {
    let outcome = receive_and_import(body, importer).await;
    match outcome {
        Ok(()) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap(),
        Err(e) => {
            error!("[IMPORT] {e}");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error importing model: {e}"),
            )
        }
    }
}

pub async fn handle_request(
    req: Request<Body>,
    importer: Arc<dyn AssetImporter>,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/upload") => Ok(upload(req.into_body(), importer).await),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found.")),
    }
}

/// Bind `addr` and return the bound address plus the server future.
pub fn bind<F>(
    addr: SocketAddr,
    importer: Arc<dyn AssetImporter>,
    shutdown: F,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>>), hyper::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let make_svc = make_service_fn(move |_conn| {
        let importer = importer.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, importer.clone())))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    Ok((local_addr, server.with_graceful_shutdown(shutdown)))
}
