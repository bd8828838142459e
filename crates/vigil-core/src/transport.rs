//! Transport seam: the external message-transport client.
//!
//! The core never talks to the network itself. Whatever carries the shared exchange
//! channel implements [`Transport`]; flood-control backoff and retries stay on that side.

use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// A file carried next to an envelope (regex lists, backups, avatars).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// What arrives from, or leaves for, the exchange channel: a sealed envelope token
/// and an optional attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub token: String,
    pub attachment: Option<Attachment>,
}

impl Packet {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Admin roster and trusted identities of one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRoster {
    pub admins: BTreeSet<i64>,
    pub trusted: BTreeSet<i64>,
}

/// External transport collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a packet on the exchange channel.
    async fn send(&self, packet: Packet) -> Result<(), TransportError>;

    /// Download a file by reference (avatars).
    async fn fetch_file(&self, file_ref: &str) -> Result<Vec<u8>, TransportError>;

    /// Look up a user's bio. `Ok(None)` when the user has none.
    async fn fetch_bio(&self, user_id: i64) -> Result<Option<String>, TransportError>;

    /// Current admin roster of a group.
    async fn group_roster(&self, group_id: i64) -> Result<GroupRoster, TransportError>;
}
