use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use axum::extract::ws::{WebSocket, Message};
use axum::http::StatusCode;
use tokio::sync::{broadcast, watch};
use tokio::time::{timeout, Duration};
use futures_util::{stream::StreamExt, SinkExt};
use tracing::{info, error, debug};

use crate::camera_manager::RemoteCameraManager;
use crate::capture::Frame;

const SEND_TIMEOUT: Duration = Duration::from_millis(50);

/// Binary message layout: one tag byte (1 = video, 2 = audio) then the payload.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.data.len() + 1);
    out.push(frame.kind.tag());
    out.extend_from_slice(&frame.data);
    out
}

/// Every frame of the camera's current source, in order, dropping only
/// when the client falls behind.
pub async fn restream_handler(
    ws: WebSocketUpgrade,
    Path(camera_id): Path<String>,
    State(manager): State<RemoteCameraManager>,
) -> Response {
    let Some(relay) = manager.relay(&camera_id).await else {
        return (StatusCode::NOT_FOUND, format!("Camera '{}' not found", camera_id)).into_response();
    };
    let frames = relay.subscribe_restream();
    ws.on_upgrade(move |socket| handle_restream(socket, camera_id, frames))
}

/// Only the most recent frame; a slow client skips straight to the newest.
pub async fn peer_handler(
    ws: WebSocketUpgrade,
    Path(peer_id): Path<String>,
    State(manager): State<RemoteCameraManager>,
) -> Response {
    let Some(relay) = manager.relay_by_peer_id(&peer_id).await else {
        return (StatusCode::NOT_FOUND, format!("Peer stream '{}' not found", peer_id)).into_response();
    };
    let latest = relay.subscribe_peer();
    ws.on_upgrade(move |socket| handle_peer(socket, peer_id, latest))
}

async fn handle_restream(socket: WebSocket, camera_id: String, mut frames: broadcast::Receiver<Frame>) {
    let (mut sender, receiver) = socket.split();
    info!("Restream client connected to camera '{}'", camera_id);

    let send_task = tokio::spawn(async move {
        let mut sent = 0u64;
        let mut dropped = 0u64;
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    match timeout(SEND_TIMEOUT, sender.send(Message::Binary(encode_frame(&frame)))).await {
                        Ok(Ok(())) => sent += 1,
                        Ok(Err(_)) => break,
                        Err(_) => {
                            dropped += 1;
                            if dropped % 10 == 0 {
                                debug!("Dropped {} frames due to slow client", dropped);
                            }
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    dropped += skipped;
                    debug!("Restream client lagged, dropped {} old frames", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Restream send task ended (sent: {}, dropped: {})", sent, dropped);
    });

    wait_for_close(send_task, receiver).await;
    info!("Restream client disconnected from camera '{}'", camera_id);
}

async fn handle_peer(socket: WebSocket, peer_id: String, mut latest: watch::Receiver<Option<Frame>>) {
    let (mut sender, receiver) = socket.split();
    info!("Peer client connected to '{}'", peer_id);

    let send_task = tokio::spawn(async move {
        loop {
            let frame = latest.borrow_and_update().clone();
            if let Some(frame) = frame {
                match timeout(SEND_TIMEOUT, sender.send(Message::Binary(encode_frame(&frame)))).await {
                    Ok(Ok(())) | Err(_) => {}
                    Ok(Err(_)) => break,
                }
            }
            if latest.changed().await.is_err() {
                break;
            }
        }
    });

    wait_for_close(send_task, receiver).await;
    info!("Peer client disconnected from '{}'", peer_id);
}

async fn wait_for_close(
    mut send_task: tokio::task::JoinHandle<()>,
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
) {
    let recv = async {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut send_task => {},
        _ = recv => send_task.abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::protocol::MessageKind;

    #[test]
    fn test_encode_frame_prefixes_kind() {
        let frame = Frame { kind: MessageKind::Audio, sequence: None, data: Bytes::from_static(b"\xAA\xBB") };
        assert_eq!(encode_frame(&frame), vec![0x02, 0xAA, 0xBB]);
    }
}
