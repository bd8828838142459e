//! Line-oriented transport over stdin/stdout.
//!
//! Outbound packets are written to stdout as one JSON object per line; whatever relays
//! the exchange channel reads them from there and feeds inbound traffic back on stdin.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;
use vigil_core::{Attachment, GroupRoster, Packet, Transport, TransportError};

#[derive(Debug, Serialize, Deserialize)]
pub struct WireAttachment {
    pub name: String,
    /// Base64 of the attachment bytes.
    pub bytes: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WirePacket {
    pub token: String,
    #[serde(default)]
    pub attachment: Option<WireAttachment>,
}

impl WirePacket {
    pub fn into_packet(self) -> Result<Packet, base64::DecodeError> {
        let packet = Packet::new(self.token);
        Ok(match self.attachment {
            Some(a) => packet.with_attachment(Attachment::new(a.name, STANDARD.decode(a.bytes)?)),
            None => packet,
        })
    }

    fn from_packet(packet: &Packet) -> Self {
        Self {
            token: packet.token.clone(),
            attachment: packet.attachment.as_ref().map(|a| WireAttachment {
                name: a.name.clone(),
                bytes: STANDARD.encode(&a.bytes),
            }),
        }
    }
}

pub struct StdioTransport {
    out: Mutex<Stdout>,
    /// Avatar references resolve to files under this directory.
    media_dir: PathBuf,
}

impl StdioTransport {
    pub fn new(media_dir: PathBuf) -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
            media_dir,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(&WirePacket::from_packet(&packet))
            .map_err(|e| TransportError::Send(e.to_string()))?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        out.flush().await.map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn fetch_file(&self, file_ref: &str) -> Result<Vec<u8>, TransportError> {
        let name = file_ref.rsplit(['/', '\\']).next().unwrap_or(file_ref);
        tokio::fs::read(self.media_dir.join(name))
            .await
            .map_err(|e| TransportError::Download(format!("{}: {}", file_ref, e)))
    }

    async fn fetch_bio(&self, _user_id: i64) -> Result<Option<String>, TransportError> {
        Err(TransportError::Unsupported("bio lookup"))
    }

    async fn group_roster(&self, _group_id: i64) -> Result<GroupRoster, TransportError> {
        Err(TransportError::Unsupported("group roster"))
    }
}
