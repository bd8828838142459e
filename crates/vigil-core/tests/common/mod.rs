//! Shared fixtures: a recording transport and context builders.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use vigil_core::{
    AgentContext, Attachment, BusCipher, Envelope, GroupRoster, MemoryBackend, Packet, PassThrough,
    StateBackend, Transport, TransportError, VigilConfig,
};

/// Deterministic test key (32 bytes, hex). NOT for production.
pub const KEY_HEX: &str = "2a313841484f565d646b727980878e959ca3aab1b8bfc6cdd4dbe2e9f0f7fe05";

pub const BOT_ID: i64 = 900;

type BioHook = Box<dyn Fn(i64) + Send + Sync>;

/// Holds a lookup open until released. `entered` fires once the lookup is waiting.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Transport that records every outbound packet and serves canned lookups.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Packet>>,
    pub bios: Mutex<HashMap<i64, String>>,
    pub rosters: Mutex<HashMap<i64, GroupRoster>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    bio_hook: Mutex<Option<BioHook>>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `hook` whenever a bio is looked up (before answering).
    pub fn on_bio(&self, hook: impl Fn(i64) + Send + Sync + 'static) {
        *self.bio_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Block the lookup named `key` (`bio:<user>` or `roster:<group>`) until released.
    pub fn gate(&self, key: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates.lock().unwrap().insert(key.to_string(), Arc::clone(&gate));
        gate
    }

    async fn pass_gate(&self, key: String) {
        let gate = self.gates.lock().unwrap().get(&key).cloned();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }

    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    /// Decoded outbound envelopes with their attachments.
    pub fn sent_envelopes(&self) -> Vec<(Envelope, Option<Attachment>)> {
        let cipher = cipher();
        self.sent()
            .into_iter()
            .map(|p| (Envelope::open(&cipher, &p.token, None, Utc::now()).unwrap(), p.attachment))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    async fn fetch_file(&self, file_ref: &str) -> Result<Vec<u8>, TransportError> {
        self.files
            .lock()
            .unwrap()
            .get(file_ref)
            .cloned()
            .ok_or_else(|| TransportError::Download(file_ref.to_string()))
    }

    async fn fetch_bio(&self, user_id: i64) -> Result<Option<String>, TransportError> {
        self.pass_gate(format!("bio:{}", user_id)).await;
        if let Some(hook) = self.bio_hook.lock().unwrap().as_ref() {
            hook(user_id);
        }
        Ok(self.bios.lock().unwrap().get(&user_id).cloned())
    }

    async fn group_roster(&self, group_id: i64) -> Result<GroupRoster, TransportError> {
        self.pass_gate(format!("roster:{}", group_id)).await;
        Ok(self.rosters.lock().unwrap().get(&group_id).cloned().unwrap_or_default())
    }
}

pub fn cipher() -> BusCipher {
    BusCipher::from_hex(KEY_HEX).unwrap()
}

pub fn config() -> VigilConfig {
    VigilConfig {
        bus_key: Some(KEY_HEX.to_string()),
        bot_ids: vec![BOT_ID],
        ..VigilConfig::default()
    }
}

pub fn context(transport: &Arc<RecordingTransport>) -> Arc<AgentContext> {
    context_with(config(), Arc::new(MemoryBackend::new()), transport)
}

pub fn context_with(
    config: VigilConfig,
    backend: Arc<dyn StateBackend>,
    transport: &Arc<RecordingTransport>,
) -> Arc<AgentContext> {
    let transport: Arc<dyn Transport> = transport.clone();
    AgentContext::build(config, backend, transport, Arc::new(PassThrough)).unwrap()
}

/// A sealed inbound packet as a peer agent would send it.
pub fn packet(from: &str, to: &[&str], action: &str, action_type: &str, data: Value) -> Packet {
    let to = to.iter().map(|s| s.to_string()).collect();
    let token = Envelope::new(from, to, action, action_type, data)
        .seal(&cipher(), Utc::now())
        .unwrap();
    Packet::new(token)
}

/// Same, with a sealed attachment.
pub fn packet_with_file(
    from: &str,
    to: &[&str],
    action: &str,
    action_type: &str,
    data: Value,
    name: &str,
    plain: &[u8],
) -> Packet {
    let sealed = cipher().seal_bytes(plain).unwrap();
    packet(from, to, action, action_type, data).with_attachment(Attachment::new(name, sealed))
}

pub fn patterns(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
