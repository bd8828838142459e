//! Signal bus: decode → recipient check → route → apply for inbound envelopes, and the
//! mirror encode → send path for outbound ones.
//!
//! Every inbound failure ends in a [`Dispatch`] value instead of an error: undecodable
//! traffic, envelopes for other agents and unknown actions are dropped, and handler
//! failures are logged. Handlers are idempotent, so replaying an envelope is harmless.

mod cipher;
mod envelope;
mod routes;

pub use cipher::{BusCipher, KEY_LEN};
pub use envelope::Envelope;
pub use routes::{route, Route};

use crate::context::AgentContext;
use crate::entities::BadKind;
use crate::error::{VigilError, VigilResult};
use crate::maintenance;
use crate::normalizer::SpecialTable;
use crate::rules::PatternCounts;
use crate::transport::{Attachment, Packet};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Suffix of rule-list file names (`ad_words`, `con_words`, ...).
const WORDS_SUFFIX: &str = "_words";

/// Outcome of handling one inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Undecodable,
    NotAddressed,
    Unrouted,
    Applied(Route),
    Failed(Route),
}

#[derive(Debug, Deserialize)]
struct TypedId {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct UserId {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Declared {
    group_id: i64,
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct Score {
    id: i64,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct Watch {
    id: i64,
    #[serde(rename = "type")]
    category: String,
    until: i64,
}

#[derive(Debug, Deserialize)]
struct Typed {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct VersionAsk {
    admin_id: i64,
    message_id: i64,
}

/// Uploaded rule list: plain patterns or a `{pattern: count}` table.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PatternUpload {
    List(Vec<String>),
    Counts(PatternCounts),
}

impl PatternUpload {
    fn into_patterns(self) -> Vec<String> {
        match self {
            Self::List(patterns) => patterns,
            Self::Counts(table) => table.patterns(),
        }
    }
}

fn payload<T: DeserializeOwned>(route: Route, data: &Value) -> VigilResult<T> {
    serde_json::from_value(data.clone()).map_err(|e| VigilError::Payload {
        route: route.to_string(),
        reason: e.to_string(),
    })
}

fn bad_kind(route: Route, raw: &str) -> VigilResult<BadKind> {
    BadKind::parse(raw).ok_or_else(|| VigilError::Payload {
        route: route.to_string(),
        reason: format!("unknown id type: {}", raw),
    })
}

/// The agent's end of the shared exchange channel.
pub struct SignalBus {
    ctx: Arc<AgentContext>,
    /// Envelope application is serialized; decode and routing are not.
    receive_lock: Mutex<()>,
}

impl SignalBus {
    pub fn new(ctx: Arc<AgentContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            receive_lock: Mutex::new(()),
        })
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Open a token. Bad keys, corrupt ciphertext and expired frames all read as `None`.
    pub fn decode(&self, token: &str) -> Option<Envelope> {
        match Envelope::open(&self.ctx.cipher, token, self.ctx.config.bus_token_ttl_secs, Utc::now()) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!(target: "vigil::bus", error = %e, "undecodable envelope dropped");
                None
            }
        }
    }

    /// Seal an envelope from this agent.
    pub fn encode(&self, to: &[String], action: &str, action_type: &str, data: Value) -> VigilResult<String> {
        Envelope::new(self.ctx.agent_name(), to.to_vec(), action, action_type, data).seal(&self.ctx.cipher, Utc::now())
    }

    /// Encode and hand to the transport.
    pub async fn emit(
        &self,
        to: &[String],
        action: &str,
        action_type: &str,
        data: Value,
        attachment: Option<Attachment>,
    ) -> VigilResult<()> {
        let mut packet = Packet::new(self.encode(to, action, action_type, data)?);
        packet.attachment = attachment;
        self.ctx.transport.send(packet).await?;
        tracing::debug!(target: "vigil::bus", ?to, action, action_type, "envelope sent");
        Ok(())
    }

    /// Handle one inbound packet.
    pub async fn handle(self: &Arc<Self>, packet: Packet) -> Dispatch {
        let Some(envelope) = self.decode(&packet.token) else {
            return Dispatch::Undecodable;
        };
        if !envelope.is_addressed_to(self.ctx.agent_name()) {
            tracing::debug!(target: "vigil::bus", from = %envelope.from, to = ?envelope.to, "envelope for other agents");
            return Dispatch::NotAddressed;
        }
        let Some(route) = route(&envelope.from, &envelope.action, &envelope.action_type, &envelope.data) else {
            tracing::debug!(
                target: "vigil::bus",
                from = %envelope.from,
                action = %envelope.action,
                action_type = %envelope.action_type,
                "unrouted envelope"
            );
            return Dispatch::Unrouted;
        };

        let _guard = self.receive_lock.lock().await;
        match self.apply(route, &envelope, packet.attachment.as_ref()).await {
            Ok(()) => {
                tracing::info!(target: "vigil::bus", from = %envelope.from, %route, "envelope applied");
                Dispatch::Applied(route)
            }
            Err(e) => {
                tracing::warn!(target: "vigil::bus", from = %envelope.from, %route, error = %e, "envelope not applied");
                Dispatch::Failed(route)
            }
        }
    }

    async fn apply(self: &Arc<Self>, route: Route, envelope: &Envelope, attachment: Option<&Attachment>) -> VigilResult<()> {
        let entities = &self.ctx.entities;
        let data = &envelope.data;
        match route {
            Route::AddBad => {
                let p: TypedId = payload(route, data)?;
                entities.add_bad(bad_kind(route, &p.kind)?, p.id)?;
            }
            Route::RemoveBad => {
                let p: TypedId = payload(route, data)?;
                entities.remove_bad(bad_kind(route, &p.kind)?, p.id)?;
            }
            Route::AddExcept => {
                let p: TypedId = payload(route, data)?;
                entities.add_except(&p.kind, p.id)?;
            }
            Route::RemoveExcept => {
                let p: TypedId = payload(route, data)?;
                entities.remove_except(&p.kind, p.id)?;
            }
            Route::AddWhite => {
                let p: UserId = payload(route, data)?;
                entities.add_white(p.id)?;
            }
            Route::RemoveWhite => {
                let p: UserId = payload(route, data)?;
                entities.remove_white(p.id)?;
            }
            Route::AddWatch => {
                let p: Watch = payload(route, data)?;
                entities.watch(p.id, &p.category, p.until)?;
            }
            Route::Declare => {
                let p: Declared = payload(route, data)?;
                entities.declare(p.group_id, p.message_id)?;
            }
            Route::UpdateScore => {
                let p: Score = payload(route, data)?;
                entities.set_score(p.id, &envelope.from, p.score)?;
            }
            Route::Clear(scope) => {
                let p: Typed = payload(route, data)?;
                entities.clear(scope, &p.kind)?;
            }
            Route::Refresh => {
                let groups = entities.groups();
                let refreshed = self.ctx.refresh_groups(&groups).await;
                tracing::info!(target: "vigil::bus", groups = groups.len(), refreshed, "rosters refreshed");
            }
            Route::BackupNow => {
                let bus = Arc::clone(self);
                tokio::spawn(async move {
                    maintenance::backup_all(&bus).await;
                });
            }
            Route::Rollback => {
                let p: Typed = payload(route, data)?;
                let blob = self.open_attachment(route, attachment)?;
                self.restore_blob(&p.kind, &blob)?;
            }
            Route::RegexUpdate => {
                let name = data.as_str().unwrap_or_default();
                let category = name.strip_suffix(WORDS_SUFFIX).ok_or_else(|| VigilError::Payload {
                    route: route.to_string(),
                    reason: format!("not a rule list: {:?}", name),
                })?;
                let blob = self.open_attachment(route, attachment)?;
                let upload: PatternUpload = serde_json::from_slice(&blob)?;
                self.ctx.rules.replace_patterns(category, &upload.into_patterns())?;
                if let Some(table) = SpecialTable::from_category(category) {
                    self.ctx.rebuild_special_table(table);
                }
            }
            Route::RegexCountAsk => {
                maintenance::report_rule_counts(self).await;
            }
            Route::VersionAsk => {
                let p: VersionAsk = payload(route, data)?;
                let reply = json!({
                    "admin_id": p.admin_id,
                    "message_id": p.message_id,
                    "version": self.ctx.config.version,
                });
                self.emit(&[envelope.from.clone()], "version", "reply", reply, None).await?;
            }
        }
        Ok(())
    }

    fn open_attachment(&self, route: Route, attachment: Option<&Attachment>) -> VigilResult<Vec<u8>> {
        let attachment = attachment.ok_or_else(|| VigilError::Payload {
            route: route.to_string(),
            reason: "missing attachment".to_string(),
        })?;
        self.ctx.cipher.open_bytes(&attachment.bytes)
    }

    /// Restore a backed-up blob: `rules/<category>` or an entity section name.
    fn restore_blob(&self, name: &str, blob: &[u8]) -> VigilResult<()> {
        match name.strip_prefix("rules/") {
            Some(category) => {
                let rules = self.ctx.rules.restore(category, blob)?;
                if let Some(table) = SpecialTable::from_category(category) {
                    self.ctx.rebuild_special_table(table);
                }
                tracing::info!(target: "vigil::bus", category, rules, "rule table rolled back");
            }
            None => {
                self.ctx.entities.restore(name, blob)?;
                tracing::info!(target: "vigil::bus", section = name, "entity section rolled back");
            }
        }
        Ok(())
    }
}
