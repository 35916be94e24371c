//! Process configuration (spec §10.1). Grounded on `liveion/src/config.rs`:
//! same `serde` + `#[serde(default)]`-on-every-substruct shape, same
//! `Config::parse` fallback chain (explicit path, then cwd `live777.toml`,
//! then `/etc/live777/live777.toml`, then pure defaults), generalised from a
//! single-protocol WHIP/WHEP config to the five listeners this relay owns.
//! `IceServer` (including its `validate`/`urls`/`From<IceServer> for
//! RTCIceServer` impls) is kept close to verbatim from the teacher.

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use webrtc::{
    ice,
    ice_transport::{ice_credential_type::RTCIceCredentialType, ice_server::RTCIceServer},
    Error,
};

use crate::error::Result;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub rtmp: Rtmp,
    #[serde(default)]
    pub rtsp: Rtsp,
    #[serde(default)]
    pub webrtc: WebRtc,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    /// Reads `path` if given, else `./live777.toml`, else
    /// `/etc/live777/live777.toml`, else pure defaults — same fallback chain
    /// as the teacher.
    pub fn parse(path: Option<&str>) -> Result<Config> {
        let candidates: Vec<&Path> = match path {
            Some(p) => vec![Path::new(p)],
            None => vec![Path::new("live777.toml"), Path::new("/etc/live777/live777.toml")],
        };
        for candidate in candidates {
            if candidate.exists() {
                let raw = std::fs::read_to_string(candidate)?;
                let cfg: Config = toml::from_str(&raw).map_err(anyhow::Error::from)?;
                cfg.validate()?;
                return Ok(cfg);
            }
        }
        Ok(Config::default())
    }

    fn validate(&self) -> Result<()> {
        for ice_server in self.webrtc.ice_servers.iter() {
            ice_server
                .validate()
                .map_err(|e| anyhow::anyhow!("ice_server error: {e}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Http {
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cors: bool,
}

impl Default for Http {
    fn default() -> Self {
        Http {
            listen: default_http_listen(),
            cors: true,
        }
    }
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from_str(&format!(
        "0.0.0.0:{}",
        env::var("PORT").unwrap_or_else(|_| "8080".into())
    ))
    .expect("invalid listen address")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rtmp {
    #[serde(default = "default_rtmp_listen")]
    pub listen: SocketAddr,
}

impl Default for Rtmp {
    fn default() -> Self {
        Rtmp {
            listen: default_rtmp_listen(),
        }
    }
}

fn default_rtmp_listen() -> SocketAddr {
    SocketAddr::from_str("0.0.0.0:1935").unwrap()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rtsp {
    #[serde(default = "default_rtsp_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_udp_rtp")]
    pub udp_rtp: u16,
    #[serde(default = "default_udp_rtcp")]
    pub udp_rtcp: u16,
    #[serde(default = "default_multicast_rtp")]
    pub multicast_rtp: u16,
    #[serde(default = "default_multicast_rtcp")]
    pub multicast_rtcp: u16,
    #[serde(default = "default_multicast_range")]
    pub multicast_range: String,
}

impl Default for Rtsp {
    fn default() -> Self {
        Rtsp {
            listen: default_rtsp_listen(),
            udp_rtp: default_udp_rtp(),
            udp_rtcp: default_udp_rtcp(),
            multicast_rtp: default_multicast_rtp(),
            multicast_rtcp: default_multicast_rtcp(),
            multicast_range: default_multicast_range(),
        }
    }
}

fn default_rtsp_listen() -> SocketAddr {
    SocketAddr::from_str("0.0.0.0:554").unwrap()
}
fn default_udp_rtp() -> u16 {
    8000
}
fn default_udp_rtcp() -> u16 {
    8001
}
fn default_multicast_rtp() -> u16 {
    8002
}
fn default_multicast_rtcp() -> u16 {
    8003
}
fn default_multicast_range() -> String {
    "224.1.0.0/16".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtc {
    #[serde(default = "default_udp_mux_port")]
    pub udp_mux_port: u16,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
}

impl Default for WebRtc {
    fn default() -> Self {
        WebRtc {
            udp_mux_port: default_udp_mux_port(),
            ice_servers: default_ice_servers(),
        }
    }
}

fn default_udp_mux_port() -> u16 {
    7000
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: "".to_string(),
        credential: "".to_string(),
        credential_type: "".to_string(),
    }]
}

/// Copied close to verbatim from `liveion::config::IceServer`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
    #[serde(default)]
    pub credential_type: String,
}

impl IceServer {
    pub(crate) fn parse_url(&self, url_str: &str) -> webrtc::error::Result<ice::url::Url> {
        Ok(ice::url::Url::parse_url(url_str)?)
    }

    pub(crate) fn validate(&self) -> webrtc::error::Result<()> {
        self.urls()?;
        Ok(())
    }

    pub(crate) fn urls(&self) -> webrtc::error::Result<Vec<ice::url::Url>> {
        let mut urls = vec![];
        for url_str in &self.urls {
            let mut url = self.parse_url(url_str)?;
            if url.scheme == ice::url::SchemeType::Turn || url.scheme == ice::url::SchemeType::Turns {
                if self.username.is_empty() || self.credential.is_empty() {
                    return Err(Error::ErrNoTurnCredentials);
                }
                url.username = self.username.clone();
                match self.credential_type.as_str().into() {
                    RTCIceCredentialType::Password => url.password = self.credential.clone(),
                    RTCIceCredentialType::Oauth => {}
                    _ => return Err(Error::ErrTurnCredentials),
                };
            }
            urls.push(url);
        }
        Ok(urls)
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(val: IceServer) -> Self {
        RTCIceServer {
            urls: val.urls,
            username: val.username,
            credential: val.credential,
            credential_type: val.credential_type.as_str().into(),
        }
    }
}

/// Ring buffer sizing knobs for the per-channel `PacketQueue` (spec §4.1).
/// Not present in the teacher (it has no packet queue); shaped the same
/// declarative way as the teacher's `Strategy` struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_min_gop_headroom")]
    pub min_gop_headroom: usize,
}

impl Default for Queue {
    fn default() -> Self {
        Queue {
            capacity: default_queue_capacity(),
            min_gop_headroom: default_min_gop_headroom(),
        }
    }
}

fn default_queue_capacity() -> usize {
    crate::queue::DEFAULT_CAPACITY
}
fn default_min_gop_headroom() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Log {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.rtmp.listen.port(), 1935);
        assert_eq!(cfg.rtsp.listen.port(), 554);
        assert_eq!(cfg.rtsp.udp_rtp, 8000);
        assert_eq!(cfg.webrtc.udp_mux_port, 7000);
    }
}
