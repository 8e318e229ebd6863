//! Per-endpoint channel handlers.
//!
//! Each channel carries one logical request (the background-removal channel
//! may carry several in sequence): zero or more `progress` text frames, then
//! exactly one binary payload or `error` text frame.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arch_engine::{Orchestrator, RelayEvent, RelayReceiver, RequestTicket, SessionKey};
use arch_types::{GenerateImageRequest, ServerMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use log::{debug, error, info, warn};
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, Role};
use tokio_tungstenite::WebSocketStream;

pub static ACTIVE_WS_CONNECTIONS: AtomicU32 = AtomicU32::new(0);

type WsSender = SplitSink<WebSocketStream<Upgraded>, WsMessage>;
type WsReceiver = SplitStream<WebSocketStream<Upgraded>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Text-to-image followed by background removal.
    GenerateImage,
    RemoveBackground,
    /// Image-to-3D reconstruction, PLY out.
    Generate3dView,
    /// Mesh decoding from the cached reconstruction, GLB out.
    Generate3dModel,
}

impl Endpoint {
    pub const ALL: [Endpoint; 4] = [
        Endpoint::GenerateImage,
        Endpoint::RemoveBackground,
        Endpoint::Generate3dView,
        Endpoint::Generate3dModel,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::GenerateImage => "/ws/generate-image",
            Endpoint::RemoveBackground => "/ws/remove-background",
            Endpoint::Generate3dView => "/ws/generate-3d-view",
            Endpoint::Generate3dModel => "/ws/generate-3d-model",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.path() == path)
    }

    /// Log tag.
    fn tag(&self) -> &'static str {
        match self {
            Endpoint::GenerateImage => "[WS_IMAGE]",
            Endpoint::RemoveBackground => "[WS_RMBG]",
            Endpoint::Generate3dView => "[WS_3D_VIEW]",
            Endpoint::Generate3dModel => "[WS_3D_MODEL]",
        }
    }

    /// Whether the channel accepts another request after a terminal message.
    fn is_reusable(&self) -> bool {
        matches!(self, Endpoint::RemoveBackground)
    }
}

/// How a relayed request ended from the channel's point of view.
#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Delivered,
    ClientGone,
}

async fn send_json(ws_sender: &mut WsSender, message: ServerMessage) -> Result<(), ()> {
    ws_sender
        .send(WsMessage::Text(message.to_json()))
        .await
        .map_err(|_| ())
}

async fn send_error(ws_sender: &mut WsSender, message: &str) -> Result<(), ()> {
    send_json(
        ws_sender,
        ServerMessage::Error {
            message: message.to_string(),
        },
    )
    .await
}

/// Forward relay events to the client until the terminal outcome, watching
/// the client side for disconnects. A disconnect abandons `ticket`; the stage
/// keeps running and its result is discarded.
async fn relay_to_client(
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
    mut events: RelayReceiver,
    ticket: &RequestTicket,
    tag: &str,
) -> Delivery {
    loop {
        tokio::select! {
            event = events.recv() => {
                let sent = match event {
                    Some(RelayEvent::Progress(p)) => {
                        debug!("{tag} {} progress {}%", p.request_id, p.percent);
                        send_json(ws_sender, ServerMessage::Progress { progress: p.percent }).await
                    }
                    Some(RelayEvent::Finished(Ok(payload))) => {
                        info!(
                            "{tag} {} done: {} bytes ({})",
                            ticket.id(),
                            payload.bytes.len(),
                            payload.content_type
                        );
                        let sent = ws_sender.send(WsMessage::Binary(payload.bytes)).await.map_err(|_| ());
                        return if sent.is_ok() { Delivery::Delivered } else { Delivery::ClientGone };
                    }
                    Some(RelayEvent::Finished(Err(e))) => {
                        if e.is_client_error() {
                            info!("{tag} {} rejected: {e}", ticket.id());
                        } else {
                            error!("{tag} {} failed: {e}", ticket.id());
                        }
                        let sent = send_error(ws_sender, &e.client_message()).await;
                        return if sent.is_ok() { Delivery::Delivered } else { Delivery::ClientGone };
                    }
                    None => {
                        error!("{tag} {} relay closed without an outcome", ticket.id());
                        let _ = send_error(ws_sender, "Internal server error").await;
                        return Delivery::Delivered;
                    }
                };
                if sent.is_err() {
                    warn!("{tag} {} send failed, abandoning request", ticket.id());
                    ticket.abandon();
                    return Delivery::ClientGone;
                }
            }
            ws_msg = ws_receiver.next() => {
                match ws_msg {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => {
                        info!("{tag} {} client disconnected mid-request, abandoning", ticket.id());
                        ticket.abandon();
                        return Delivery::ClientGone;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_sender.send(WsMessage::Pong(data)).await;
                    }
                    // Anything else while a request is in flight is ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Start the request a client frame asks for, if it is one this endpoint accepts.
fn start_request(
    endpoint: Endpoint,
    message: WsMessage,
    session: &SessionKey,
    orchestrator: &Orchestrator,
    ticket: &RequestTicket,
) -> Result<RelayReceiver, &'static str> {
    match (endpoint, message) {
        (Endpoint::GenerateImage, WsMessage::Text(text)) => {
            let request: GenerateImageRequest =
                serde_json::from_str(&text).map_err(|_| "Invalid JSON format")?;
            Ok(orchestrator.generate_image(ticket.clone(), request))
        }
        (Endpoint::GenerateImage, _) => Err("Expected a JSON text message"),
        (Endpoint::RemoveBackground, WsMessage::Binary(image)) => {
            Ok(orchestrator.remove_background(ticket.clone(), image))
        }
        (Endpoint::Generate3dView, WsMessage::Binary(image)) => {
            Ok(orchestrator.reconstruct(ticket.clone(), image, session.clone()))
        }
        _ => Err("Expected binary image data"),
    }
}

// WebSocket handler shared by every pipeline endpoint
pub async fn handle_pipeline_ws(
    upgraded: Upgraded,
    endpoint: Endpoint,
    session: SessionKey,
    orchestrator: Arc<Orchestrator>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let tag = endpoint.tag();

    let conn_count = ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    info!("{tag} New WebSocket connection (session '{session}', {conn_count} active)");

    let mut client_gone = false;
    if endpoint == Endpoint::Generate3dModel {
        // Needs no input: starts as soon as the channel opens.
        let ticket = RequestTicket::new();
        let events = orchestrator.decode_mesh(ticket.clone(), session.clone());
        client_gone = relay_to_client(&mut ws_sender, &mut ws_receiver, events, &ticket, tag).await
            == Delivery::ClientGone;
    } else {
        while let Some(msg) = ws_receiver.next().await {
            let message = match msg {
                Ok(WsMessage::Close(_)) => {
                    info!("{tag} Received Close message");
                    client_gone = true;
                    break;
                }
                Ok(WsMessage::Ping(data)) => {
                    let _ = ws_sender.send(WsMessage::Pong(data)).await;
                    continue;
                }
                Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => continue,
                Ok(message) => message,
                Err(e) => {
                    debug!("{tag} Read error: {e}");
                    client_gone = true;
                    break;
                }
            };

            let ticket = RequestTicket::new();
            let delivery = match start_request(endpoint, message, &session, &orchestrator, &ticket) {
                Ok(events) => {
                    debug!("{tag} Request {} started", ticket.id());
                    relay_to_client(&mut ws_sender, &mut ws_receiver, events, &ticket, tag).await
                }
                Err(reason) => {
                    warn!("{tag} Rejected frame: {reason}");
                    match send_error(&mut ws_sender, reason).await {
                        Ok(()) => Delivery::Delivered,
                        Err(()) => Delivery::ClientGone,
                    }
                }
            };

            if delivery == Delivery::ClientGone {
                client_gone = true;
                break;
            }
            if !endpoint.is_reusable() {
                break;
            }
        }
    }

    if !client_gone {
        let _ = ws_sender.send(WsMessage::Close(None)).await;
        let _ = ws_sender.flush().await;
    }
    let conn_count = ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::SeqCst) - 1;
    info!("{tag} WebSocket connection closed ({conn_count} active)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_paths_round_trip() {
        for endpoint in Endpoint::ALL {
            assert_eq!(Endpoint::from_path(endpoint.path()), Some(endpoint));
        }
        assert_eq!(Endpoint::from_path("/ws/chat"), None);
    }

    #[test]
    fn test_only_background_removal_is_reusable() {
        let reusable: Vec<_> = Endpoint::ALL.into_iter().filter(|e| e.is_reusable()).collect();
        assert_eq!(reusable, vec![Endpoint::RemoveBackground]);
    }
}
