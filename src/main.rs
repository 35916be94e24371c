use std::net::SocketAddr;

use clap::Parser;
use relay::config::Config;
use relay::{log, supervisor};
use tracing::{debug, error, warn};

#[derive(Parser)]
#[command(version)]
struct Args {
    /// Set config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Override `http.listen`
    #[arg(long)]
    http_listen: Option<SocketAddr>,

    /// Override `rtmp.listen`
    #[arg(long)]
    rtmp_listen: Option<SocketAddr>,

    /// Override `rtsp.listen`
    #[arg(long)]
    rtsp_listen: Option<SocketAddr>,

    /// Override `webrtc.udp_mux_port`
    #[arg(long)]
    webrtc_udp_mux_port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut cfg = match Config::parse(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Some(listen) = args.http_listen {
        cfg.http.listen = listen;
    }
    if let Some(listen) = args.rtmp_listen {
        cfg.rtmp.listen = listen;
    }
    if let Some(listen) = args.rtsp_listen {
        cfg.rtsp.listen = listen;
    }
    if let Some(port) = args.webrtc_udp_mux_port {
        cfg.webrtc.udp_mux_port = port;
    }

    log::set(format!("relay={},webrtc=error", cfg.log.level));
    warn!("set log level : {}", cfg.log.level);
    debug!("config : {:?}", cfg);

    if let Err(e) = supervisor::run(cfg).await {
        error!("relay exited with an error: {e}");
        std::process::exit(1);
    }
}
