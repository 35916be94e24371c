//! Minimal RTSP request/response framing shared by the ingest and egress
//! RTSP sessions (spec §4.3.2, §4.4.2): reading either the next RTSP message
//! or the next `$`-prefixed TCP-interleaved data frame (RFC 2326 §10.12) off
//! one connection, and writing both back out.
//!
//! Grounded on `libs/rtsp/src/tcp_stream.rs`'s `parse_interleaved_frame`/
//! `build_interleaved_frame` for the interleaving shape, and on
//! `libs/rtsp/src/server/unified_session.rs::read_request`'s
//! `rtsp_types::Message::parse` / `ParseError::Incomplete` read-loop. Neither
//! is exported from `libs/rtsp` (both are private to that crate), so this is
//! a fresh, narrower implementation rather than a re-export.

use anyhow::{anyhow, Result};
use rtsp_types::{headers, Message, Method, Response, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::warn;

pub const INTERLEAVED_MARKER: u8 = 0x24; // ASCII '$'

pub enum Frame {
    Rtsp(rtsp_types::Request<Vec<u8>>),
    Interleaved { channel: u8, data: Vec<u8> },
}

/// Buffers bytes off one half of a split TCP stream and yields whichever of
/// an RTSP request or an interleaved data frame completes next.
pub struct RtspReader {
    reader: OwnedReadHalf,
    buffer: Vec<u8>,
}

impl RtspReader {
    pub fn new(reader: OwnedReadHalf) -> Self {
        RtspReader {
            reader,
            buffer: Vec::new(),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.try_parse()? {
                return Ok(frame);
            }
            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(anyhow!("RTSP connection closed"));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_parse(&mut self) -> Result<Option<Frame>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        if self.buffer[0] == INTERLEAVED_MARKER {
            if self.buffer.len() < 4 {
                return Ok(None);
            }
            let channel = self.buffer[1];
            let len = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
            if self.buffer.len() < 4 + len {
                return Ok(None);
            }
            let data = self.buffer[4..4 + len].to_vec();
            self.buffer.drain(0..4 + len);
            return Ok(Some(Frame::Interleaved { channel, data }));
        }
        match Message::<Vec<u8>>::parse(&self.buffer) {
            Ok((Message::Request(request), consumed)) => {
                self.buffer.drain(0..consumed);
                Ok(Some(Frame::Rtsp(request)))
            }
            Ok((_, consumed)) => {
                self.buffer.drain(0..consumed);
                Ok(None)
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => Ok(None),
            Err(e) => Err(anyhow!("RTSP parse error: {e:?}")),
        }
    }
}

pub struct RtspWriter {
    writer: OwnedWriteHalf,
}

impl RtspWriter {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        RtspWriter { writer }
    }

    pub async fn send_response(&mut self, response: &rtsp_types::Response<Vec<u8>>) -> Result<()> {
        let mut buf = Vec::new();
        response.write(&mut buf)?;
        self.writer.write_all(&buf).await?;
        Ok(())
    }

    pub async fn send_interleaved(&mut self, channel: u8, data: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(4 + data.len());
        frame.push(INTERLEAVED_MARKER);
        frame.push(channel);
        frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
        frame.extend_from_slice(data);
        self.writer.write_all(&frame).await?;
        Ok(())
    }
}

/// Parses the `client_port=<a>-<b>` pair out of a `Transport` header value,
/// the same shape as `libs/rtsp/src/server/handler.rs::parse_client_ports`.
pub fn parse_client_ports(transport: &str) -> Option<(u16, u16)> {
    let ports = transport
        .split("client_port=")
        .nth(1)?
        .split(';')
        .next()?
        .split('-')
        .collect::<Vec<_>>();
    if ports.len() != 2 {
        return None;
    }
    Some((ports[0].parse().ok()?, ports[1].parse().ok()?))
}

/// Parses the `interleaved=<a>-<b>` channel pair out of a `Transport` header.
pub fn parse_interleaved_channels(transport: &str) -> Option<(u8, u8)> {
    let chans = transport
        .split("interleaved=")
        .nth(1)?
        .split(';')
        .next()?
        .split('-')
        .collect::<Vec<_>>();
    if chans.is_empty() {
        return None;
    }
    let rtp = chans[0].parse().ok()?;
    let rtcp = chans.get(1).and_then(|s| s.parse().ok()).unwrap_or(rtp + 1);
    Some((rtp, rtcp))
}

pub fn is_tcp_transport(transport: &str) -> bool {
    transport.contains("RTP/AVP/TCP") || transport.contains("interleaved=")
}

pub fn is_multicast_transport(transport: &str) -> bool {
    transport.contains("multicast")
}

/// Which session type a freshly accepted RTSP connection turns out to be,
/// decided by its first non-OPTIONS request (spec §4.3.2/§4.4.2 share one
/// listener: ANNOUNCE starts a publish session, DESCRIBE starts a play one).
pub enum SniffedRole {
    Ingest(rtsp_types::Request<Vec<u8>>),
    Egress(rtsp_types::Request<Vec<u8>>),
}

fn cseq_of(request: &rtsp_types::Request<Vec<u8>>) -> String {
    request
        .header(&headers::CSEQ)
        .map(|h| h.as_str().to_string())
        .unwrap_or_else(|| "0".to_string())
}

/// Reads requests off one freshly accepted connection until ANNOUNCE or
/// DESCRIBE arrives, answering OPTIONS inline (and rejecting anything else
/// as out of sequence) so the caller never has to guess ahead of time which
/// session type to hand the connection to.
pub async fn sniff_role(reader: &mut RtspReader, writer: &mut RtspWriter) -> Result<SniffedRole> {
    loop {
        match reader.read_frame().await? {
            Frame::Rtsp(request) => match request.method() {
                Method::Options => {
                    let response = Response::builder(Version::V1_0, StatusCode::Ok)
                        .header(headers::CSEQ, cseq_of(&request))
                        .header(
                            headers::PUBLIC,
                            "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, ANNOUNCE, RECORD, GET_PARAMETER",
                        )
                        .empty()
                        .map_body(|_| vec![]);
                    writer.send_response(&response).await?;
                }
                Method::Announce => return Ok(SniffedRole::Ingest(request)),
                Method::Describe => return Ok(SniffedRole::Egress(request)),
                other => {
                    warn!(?other, "rtsp: unexpected first request, session rejected");
                    let response = Response::builder(Version::V1_0, StatusCode::MethodNotValidInThisState)
                        .header(headers::CSEQ, cseq_of(&request))
                        .empty()
                        .map_body(|_| vec![]);
                    writer.send_response(&response).await?;
                    return Err(anyhow!("unexpected first RTSP request: {other:?}"));
                }
            },
            Frame::Interleaved { .. } => {
                // stray data before any session exists; nothing to route it to yet
            }
        }
    }
}
