//! Supervisor (spec §4.5, §5, §6): owns the process-wide `Registry`, starts
//! the RTMP, RTSP, HTTP/WS and WebRTC-UDP-mux listeners, and sequences
//! shutdown.
//!
//! Grounded on `liveion/src/lib.rs::server_up`'s axum `Router` assembly
//! (`CorsLayer`/`TraceLayer`, `axum::serve(..).with_graceful_shutdown(..)`,
//! then a post-`serve` teardown call on the owned manager) and
//! `libs/signal::wait_for_stop_signal` for the SIGINT/SIGTERM/SIGHUP trigger.
//! The RTMP/RTSP accept loops have no direct teacher analogue (`liveion`
//! only ever runs the one axum listener) and are written from the same
//! `tokio::select!`-against-a-shutdown-channel shape `libs/rtsp`'s commented
//! out `RtspServer::start` sketches.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path as AxumPath, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};
use webrtc::ice::udp_mux::{UDPMux, UDPMuxDefault, UDPMuxParams};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::Config;
use crate::egress;
use crate::error::{RelayError, Result};
use crate::ingest;
use crate::registry::Registry;
use crate::rtsp_wire::{RtspReader, RtspWriter, SniffedRole};

/// Shared state every HTTP/WS route closes over (spec §4.3.3/§4.4.5: the
/// WebRTC routes need the process-wide signalling `API` and ICE server
/// list; the FLV routes only need the `Registry`).
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub webrtc_api: Arc<webrtc::api::API>,
    pub ice_servers: Vec<RTCIceServer>,
}

impl AppState {
    #[cfg(test)]
    pub async fn for_test(registry: Arc<Registry>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind test udp mux");
        let udp_mux = build_udp_mux(socket);
        let api = ingest::webrtc::build_api(udp_mux).expect("build webrtc api");
        AppState {
            registry,
            webrtc_api: Arc::new(api),
            ice_servers: Vec::new(),
        }
    }
}

fn build_udp_mux(socket: UdpSocket) -> Arc<dyn UDPMux + Send + Sync> {
    UDPMuxDefault::new(UDPMuxParams::new(socket))
}

/// Binds every listener named in spec §6, then blocks until
/// `signal::wait_for_stop_signal` resolves; on return, closes the listeners
/// and every live channel (spec §4.5: "shutdown closes all listeners, then
/// closes every channel in the Registry").
pub async fn run(config: Config) -> Result<()> {
    let registry = Arc::new(Registry::new(config.queue.capacity, config.queue.min_gop_headroom));

    let udp_socket = UdpSocket::bind(("0.0.0.0", config.webrtc.udp_mux_port)).await?;
    let udp_mux = build_udp_mux(udp_socket);
    let api = ingest::webrtc::build_api(udp_mux)
        .map_err(|e| RelayError::Fatal(anyhow::anyhow!(e.to_string())))?;
    let ice_servers: Vec<RTCIceServer> = config.webrtc.ice_servers.iter().cloned().map(Into::into).collect();
    let state = AppState {
        registry: registry.clone(),
        webrtc_api: Arc::new(api),
        ice_servers,
    };

    let rtmp_listener = TcpListener::bind(config.rtmp.listen).await?;
    let rtsp_listener = TcpListener::bind(config.rtsp.listen).await?;
    let http_listener = TcpListener::bind(config.http.listen).await?;

    info!(
        rtmp = %config.rtmp.listen,
        rtsp = %config.rtsp.listen,
        http = %config.http.listen,
        webrtc_udp_mux = config.webrtc.udp_mux_port,
        "relay listening"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let rtmp_task = tokio::spawn(accept_rtmp(rtmp_listener, registry.clone(), shutdown_tx.subscribe()));
    let rtsp_task = tokio::spawn(accept_rtsp(rtsp_listener, registry.clone(), shutdown_tx.subscribe()));

    let app = router(state, config.http.cors);
    let mut http_shutdown = shutdown_tx.subscribe();
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            })
            .await
    });

    let reason = signal::wait_for_stop_signal().await;
    info!(reason, "shutdown signal received, closing listeners");
    let _ = shutdown_tx.send(());

    let _ = rtmp_task.await;
    let _ = rtsp_task.await;
    if let Ok(Err(e)) = http_task.await {
        warn!(error = %e, "http listener shut down with an error");
    }

    registry.shutdown_all().await;
    info!("shutdown complete");
    Ok(())
}

async fn accept_rtmp(listener: TcpListener, registry: Arc<Registry>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let registry = registry.clone();
                        tokio::spawn(
                            crate::rtmp::handle_connection(stream, registry)
                                .instrument(crate::rtmp::span(peer_addr)),
                        );
                    }
                    Err(e) => warn!(error = %e, "rtmp accept failed"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn accept_rtsp(listener: TcpListener, registry: Arc<Registry>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let registry = registry.clone();
                        tokio::spawn(dispatch_rtsp(stream, peer_addr, registry));
                    }
                    Err(e) => warn!(error = %e, "rtsp accept failed"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// One freshly accepted RTSP connection shares its port between ingest and
/// egress (spec §4.3.2/§4.4.2): the first non-OPTIONS request decides which
/// session type owns it.
async fn dispatch_rtsp(stream: TcpStream, peer_addr: SocketAddr, registry: Arc<Registry>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = RtspReader::new(read_half);
    let mut writer = RtspWriter::new(write_half);
    match crate::rtsp_wire::sniff_role(&mut reader, &mut writer).await {
        Ok(SniffedRole::Ingest(first)) => {
            ingest::rtsp::handle_connection_with_first(reader, writer, peer_addr, registry, first)
                .instrument(ingest::rtsp::span(peer_addr))
                .await;
        }
        Ok(SniffedRole::Egress(first)) => {
            egress::rtsp::handle_connection_with_first(reader, writer, peer_addr, registry, first)
                .instrument(egress::rtsp::span(peer_addr))
                .await;
        }
        Err(e) => warn!(%peer_addr, error = %e, "rtsp session rejected before role decided"),
    }
}

fn router(state: AppState, cors: bool) -> Router {
    let mut app = Router::new()
        .route("/httpflv/*path", get(egress::http_flv::handle))
        .route("/webrtc/pusher/:path", get(webrtc_pusher))
        .route("/webrtc/player/:path", get(webrtc_player))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(crate::static_ui::healthz))
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    app = crate::static_ui::mount(app);
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

async fn webrtc_pusher(
    AxumPath(path): AxumPath<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let path = format!("/{}", path.trim_start_matches('/'));
    ws.on_upgrade(move |socket| {
        ingest::webrtc::handle_publish(socket, path, state.registry, state.webrtc_api, state.ice_servers)
    })
}

async fn webrtc_player(
    AxumPath(path): AxumPath<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let path = format!("/{}", path.trim_start_matches('/'));
    ws.on_upgrade(move |socket| {
        egress::webrtc::handle_play(socket, path, state.registry, state.webrtc_api, state.ice_servers)
    })
}

async fn metrics_handler() -> impl IntoResponse {
    ([(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], crate::metrics::encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_state_for_test_builds_a_webrtc_api() {
        let state = AppState::for_test(Arc::new(Registry::new(16, 0))).await;
        assert_eq!(state.registry.live_count().await, 0);
    }

    #[tokio::test]
    async fn router_builds_with_and_without_cors() {
        let state = AppState::for_test(Arc::new(Registry::new(16, 0))).await;
        let _ = router(state.clone(), true);
        let _ = router(state, false);
    }
}
