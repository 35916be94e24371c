//! HTTP-FLV and WebSocket-FLV egress (spec §4.4.3).
//!
//! Grounded on `original_source/.../httpflv_server.go`'s shared muxer
//! between the chunked-HTTP and WebSocket paths ("flush after every tag")
//! and on `ingest::webrtc`'s `axum::extract::ws` idiom for the WebSocket
//! half. The teacher has no HTTP-FLV code to draw on at all (`liveion` only
//! ever speaks WHIP/WHEP), so the muxing itself reuses `bridge::flv`
//! directly and the transport plumbing is written fresh.
//!
//! Both transports share one producer task (`run`) that mints FLV bytes
//! onto an `mpsc` channel one tag at a time; the HTTP path wraps the
//! receiver as a chunked streaming body, the WebSocket path forwards each
//! chunk as a binary frame. Neither buffers a whole response: the first
//! bytes out are the FLV signature (spec §8, S1), with the keyframe the
//! cursor is anchored at arriving within its first video tag.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::bridge::flv::FlvMuxState;
use crate::queue::ReadOutcome;
use crate::registry::Channel;
use crate::supervisor::AppState;

const CHANNEL_DEPTH: usize = 64;

/// `GET /httpflv/*path`: upgrades to WebSocket-FLV if `Sec-WebSocket-Key` is
/// present (axum's `WebSocketUpgrade` extractor only succeeds when the
/// upgrade headers are there), otherwise serves chunked HTTP-FLV.
pub async fn handle(
    AxumPath(path): AxumPath<String>,
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let path = format!("/{}", path.trim_start_matches('/'));
    let Some(channel) = state.registry.get(&path).await else {
        return (StatusCode::NOT_FOUND, format!("{path} not found")).into_response();
    };
    if channel.streams().await.is_none() {
        return (StatusCode::NOT_FOUND, format!("{path} not live")).into_response();
    }

    if let Some(ws) = ws {
        return ws.on_upgrade(move |socket| handle_ws(socket, channel));
    }

    let (tx, rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    tokio::spawn(run(channel, tx));
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("video/x-flv"));
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

async fn handle_ws(mut socket: WebSocket, channel: Arc<Channel>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let producer = tokio::spawn(run(channel, tx));
    while let Some(chunk) = rx.recv().await {
        if socket.send(Message::Binary(chunk)).await.is_err() {
            break;
        }
    }
    producer.abort();
}

/// Reads the channel's catalog and subscribes, then drains packets onto
/// `tx` as FLV bytes: the file header and every sequence header first, then
/// one message per tag (spec §4.4.3: "flushed at every tag").
async fn run(channel: Arc<Channel>, tx: mpsc::Sender<Bytes>) {
    let Some(catalog) = channel.streams().await else { return };
    let mut mux = FlvMuxState::new();
    let has_video = catalog.iter().any(|d| d.is_video());
    let has_audio = catalog.iter().any(|d| d.is_audio());

    let Ok(header) = mux.file_header(has_video, has_audio) else { return };
    if tx.send(header).await.is_err() {
        return;
    }
    if let Ok(seq) = mux.sequence_headers(&catalog) {
        if !seq.is_empty() && tx.send(seq).await.is_err() {
            return;
        }
    }

    let mut cursor = match channel.subscribe().await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "http-flv: failed to subscribe");
            return;
        }
    };

    loop {
        let packet = match cursor.read_packet().await {
            ReadOutcome::Packet(p) => p,
            ReadOutcome::EndOfStream => break,
        };
        let Some(descriptor) = catalog.get(packet.stream_index as usize) else {
            continue;
        };
        match mux.mux_packet(&packet, descriptor) {
            Ok(tag) if !tag.is_empty() => {
                if tx.send(tag).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "http-flv: dropping unmuxable packet"),
        }
    }
    channel.unsubscribe();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let state = AppState::for_test(Arc::new(Registry::new(16))).await;
        let response = handle(AxumPath("live/missing".to_string()), State(state), None).await;
        assert_eq!(response.into_response().status(), StatusCode::NOT_FOUND);
    }
}
