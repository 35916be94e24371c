//! Shared RTMP connection handling (spec §4.3.1, §4.4.1, §6): publish and
//! play share one TCP port, so the role can't be chosen until the AMF
//! `publish` or `play` command arrives on the `ServerSession` the `connect`
//! handshake opened. This module owns the handshake, the single
//! `ServerSession`, the socket split and the read loop; `ingest::rtmp` and
//! `egress::rtmp` each supply only the event handling for their own role,
//! reached once `PublishStreamRequested`/`PlayStreamRequested` decides it.

use std::sync::Arc;

use rml_rtmp::sessions::{ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use crate::egress::rtmp as egress_rtmp;
use crate::error::{RelayError, Result};
use crate::ingest::rtmp as ingest_rtmp;
use crate::registry::Registry;

enum Role {
    Undecided,
    Publish(ingest_rtmp::PublishState),
    Play(egress_rtmp::PlayState),
}

/// Handles one accepted RTMP TCP connection end to end, dispatching to
/// publish or play handling once the role is known (spec §4.3.1, §4.4.1
/// terminal states).
pub async fn handle_connection(stream: TcpStream, registry: Arc<Registry>) {
    let peer_addr = stream.peer_addr().ok();
    if let Err(e) = run(stream, &registry).await {
        warn!(?peer_addr, error = %e, "rtmp session ended");
    }
}

async fn run(stream: TcpStream, registry: &Arc<Registry>) -> Result<()> {
    let mut stream = stream;
    ingest_rtmp::perform_handshake(&mut stream).await?;
    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));

    let config = ServerSessionConfig::new();
    let (mut session, initial_results) =
        ServerSession::new(config).map_err(|e| RelayError::protocol(0, e.to_string()))?;
    let mut role = Role::Undecided;
    process_results(&writer, &mut session, initial_results, &mut role, registry).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let results = session
            .handle_input(&buf[..n])
            .map_err(|e| RelayError::protocol(0, e.to_string()))?;
        process_results(&writer, &mut session, results, &mut role, registry).await?;
    }

    match &mut role {
        Role::Publish(state) => ingest_rtmp::finish_publish(state, registry).await,
        Role::Play(state) => egress_rtmp::finish_play(state).await,
        Role::Undecided => {}
    }
    Ok(())
}

async fn process_results(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    session: &mut ServerSession,
    results: Vec<ServerSessionResult>,
    role: &mut Role,
    registry: &Arc<Registry>,
) -> Result<()> {
    for result in results {
        match result {
            ServerSessionResult::OutboundResponse(packet) => {
                writer.lock().await.write_all(&packet.bytes).await?;
            }
            ServerSessionResult::RaisedEvent(event) => {
                Box::pin(handle_event(writer, session, event, role, registry)).await?;
            }
            ServerSessionResult::UnhandledAmf0Command { .. } => {}
        }
    }
    Ok(())
}

async fn handle_event(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    session: &mut ServerSession,
    event: ServerSessionEvent,
    role: &mut Role,
    registry: &Arc<Registry>,
) -> Result<()> {
    match event {
        ServerSessionEvent::ConnectionRequested { request_id, .. } => {
            let results = session
                .accept_request(request_id)
                .map_err(|e| RelayError::protocol(0, e.to_string()))?;
            Box::pin(process_results(writer, session, results, role, registry)).await?;
        }
        ServerSessionEvent::PublishStreamRequested {
            request_id,
            app_name,
            stream_key,
            ..
        } => {
            let state = ingest_rtmp::begin_publish(registry, &app_name, &stream_key).await?;
            let results = session
                .accept_request(request_id)
                .map_err(|e| RelayError::protocol(0, e.to_string()))?;
            *role = Role::Publish(state);
            Box::pin(process_results(writer, session, results, role, registry)).await?;
        }
        ServerSessionEvent::PlayStreamRequested {
            request_id,
            app_name,
            stream_key,
            stream_id,
            ..
        } => {
            let state =
                egress_rtmp::begin_play(registry, &app_name, &stream_key, stream_id, writer.clone()).await?;
            let results = session
                .accept_request(request_id)
                .map_err(|e| RelayError::protocol(0, e.to_string()))?;
            *role = Role::Play(state);
            Box::pin(process_results(writer, session, results, role, registry)).await?;
        }
        ServerSessionEvent::StreamMetadataChanged { metadata, .. } => {
            if let Role::Publish(state) = role {
                ingest_rtmp::on_metadata(state, &metadata).await?;
            }
        }
        ServerSessionEvent::VideoDataReceived { data, timestamp, .. } => {
            if let Role::Publish(state) = role {
                ingest_rtmp::on_video(state, &data, timestamp.value).await?;
            }
        }
        ServerSessionEvent::AudioDataReceived { data, timestamp, .. } => {
            if let Role::Publish(state) = role {
                ingest_rtmp::on_audio(state, &data, timestamp.value).await?;
            }
        }
        ServerSessionEvent::PublishStreamFinished { .. } | ServerSessionEvent::StreamKeyReleased { .. } => {
            if let Role::Publish(state) = role {
                ingest_rtmp::finish_publish(state, registry).await;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Used by the supervisor's accept loop to tag each connection's tracing
/// span with its remote address (spec §10.3).
pub fn span(peer: std::net::SocketAddr) -> tracing::Span {
    tracing::info_span!("rtmp_session", remote_addr = %peer)
}
