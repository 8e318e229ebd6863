use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arch_import::{bind, AssetImporter, ImportError};
use hyper::{Body, Client, Method, Request, StatusCode};

#[derive(Default)]
struct RecordingImporter {
    seen: Mutex<Vec<(PathBuf, Vec<u8>)>>,
}

impl AssetImporter for RecordingImporter {
    fn import(&self, path: &Path) -> Result<(), ImportError> {
        let bytes = std::fs::read(path)?;
        self.seen.lock().unwrap().push((path.to_path_buf(), bytes));
        Ok(())
    }
}

struct FailingImporter;

impl AssetImporter for FailingImporter {
    fn import(&self, _path: &Path) -> Result<(), ImportError> {
        Err(ImportError::Rejected("no active scene".to_string()))
    }
}

async fn start(importer: Arc<dyn AssetImporter>) -> SocketAddr {
    let (addr, server) = bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        importer,
        std::future::pending(),
    )
    .unwrap();
    tokio::spawn(server);
    addr
}

async fn post(addr: SocketAddr, path: &str, body: &'static [u8]) -> (StatusCode, String) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{addr}{path}"))
        .body(Body::from(body))
        .unwrap();
    let response = Client::new().request(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, String::from_utf8_lossy(&body).to_string())
}

#[tokio::test]
async fn test_upload_is_staged_and_imported() {
    let importer = Arc::new(RecordingImporter::default());
    let addr = start(importer.clone()).await;

    let (status, body) = post(addr, "/upload", b"glTF-binary-blob").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());

    let seen = importer.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (path, bytes) = &seen[0];
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("glb"));
    assert_eq!(bytes, b"glTF-binary-blob");
    // The staged file outlives the request.
    assert!(path.exists());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_import_failure_is_500_with_reason() {
    let addr = start(Arc::new(FailingImporter)).await;
    let (status, body) = post(addr, "/upload", b"glTF").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Error importing model: no active scene");
}

#[tokio::test]
async fn test_other_paths_are_not_found() {
    let addr = start(Arc::new(FailingImporter)).await;
    let (status, body) = post(addr, "/elsewhere", b"").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Not Found.");

    let response = Client::new()
        .get(format!("http://{addr}/upload").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
