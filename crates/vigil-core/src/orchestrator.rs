//! Join orchestrator: the per-member workflow for a batch of newly joined identities.
//!
//! ```text
//! START → skip if Class D or bot
//!       → halt the whole batch if a peer declared the message
//!       → init identity record
//!       → NOSPAM name/bio check (skip this member only)
//!       → avatar diff, publish in the background
//!       → record join time → NEXT | END
//! ```
//!
//! Halting on a declared message stops every remaining member of the event, not just
//! the current one. Members already processed keep their effects.
//!
//! Roster and bio lookups run outside the join lock, so a slow transport never stalls
//! other batches.

use crate::bus::SignalBus;
use crate::classifier::TextKind;
use crate::context::AgentContext;
use crate::error::VigilResult;
use crate::transport::Attachment;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// One identity from a join event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewMember {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    /// Reference of the current avatar file, if the identity has one.
    #[serde(default)]
    pub avatar: Option<String>,
}

impl NewMember {
    pub fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        }
    }
}

/// A join service message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinEvent {
    pub group_id: i64,
    pub message_id: i64,
    /// Event time, unix seconds.
    pub date: i64,
    /// Identity that produced the event (the inviter, or the joiner themselves).
    #[serde(default)]
    pub sender: Option<i64>,
    pub members: Vec<NewMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ClassD,
    Bot,
    /// Name or bio flagged by the NOSPAM check.
    NoSpam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Skipped(SkipReason),
    Processed { new_identity: bool, avatar_published: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberOutcome {
    pub user_id: i64,
    pub status: MemberStatus,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<MemberOutcome>,
    /// The batch stopped at a declared message.
    pub halted: bool,
    /// The event was ignored because of who sent it.
    pub ignored: bool,
    /// Background avatar publications; never awaited by the batch itself.
    pub avatar_tasks: Vec<JoinHandle<()>>,
}

pub struct JoinOrchestrator {
    bus: Arc<SignalBus>,
    join_lock: Mutex<()>,
}

impl JoinOrchestrator {
    pub fn new(bus: Arc<SignalBus>) -> Self {
        Self {
            bus,
            join_lock: Mutex::new(()),
        }
    }

    fn ctx(&self) -> &Arc<AgentContext> {
        self.bus.context()
    }

    /// Run the join workflow over every member of `event`.
    #[tracing::instrument(skip_all, fields(group_id = event.group_id, message_id = event.message_id))]
    pub async fn handle_join(&self, event: &JoinEvent) -> BatchReport {
        let ctx = Arc::clone(self.ctx());
        let gid = event.group_id;
        let mut report = BatchReport::default();

        if !ctx.entities.groups().contains(&gid) {
            if let Err(e) = ctx.refresh_group(gid).await {
                tracing::warn!(target: "vigil::orchestrator", group_id = gid, error = %e, "roster unavailable");
            }
        }

        if let Some(sender) = event.sender {
            if ctx.entities.is_class_c(gid, sender) || ctx.entities.is_class_e_user(sender) {
                tracing::debug!(target: "vigil::orchestrator", sender, "join by privileged sender ignored");
                report.ignored = true;
                return report;
            }
        }

        let nospam = ctx
            .config
            .nospam_id
            .is_some_and(|id| ctx.entities.is_admin(gid, id));

        for member in &event.members {
            let uid = member.id;

            if ctx.entities.is_class_d_user(uid) {
                report.outcomes.push(MemberOutcome { user_id: uid, status: MemberStatus::Skipped(SkipReason::ClassD) });
                continue;
            }
            if member.is_bot {
                report.outcomes.push(MemberOutcome { user_id: uid, status: MemberStatus::Skipped(SkipReason::Bot) });
                continue;
            }

            if ctx.entities.is_declared(gid, event.message_id) {
                tracing::info!(target: "vigil::orchestrator", user_id = uid, "message declared by a peer; batch halted");
                report.halted = true;
                break;
            }

            match self.process_member(event, member, nospam).await {
                Ok((status, task)) => {
                    report.avatar_tasks.extend(task);
                    report.outcomes.push(MemberOutcome { user_id: uid, status });
                }
                Err(e) => {
                    tracing::warn!(target: "vigil::orchestrator", user_id = uid, error = %e, "member not fully processed");
                }
            }
        }

        report
    }

    /// The join lock is held for the store mutations of one member and released while
    /// the bio is looked up.
    async fn process_member(
        &self,
        event: &JoinEvent,
        member: &NewMember,
        nospam: bool,
    ) -> VigilResult<(MemberStatus, Option<JoinHandle<()>>)> {
        let ctx = self.ctx();
        let uid = member.id;

        let new_identity = {
            let _guard = self.join_lock.lock().await;
            let new_identity = ctx.entities.init_identity(uid)?;
            if nospam && self.name_flagged(member) {
                return Ok((MemberStatus::Skipped(SkipReason::NoSpam), None));
            }
            new_identity
        };

        if nospam {
            let bio = self.fetch_bio(uid).await;
            if self.bio_flagged(uid, &bio) {
                return Ok((MemberStatus::Skipped(SkipReason::NoSpam), None));
            }
        }

        let _guard = self.join_lock.lock().await;
        let mut task = None;
        if let Some(avatar) = member.avatar.as_deref().filter(|a| !a.is_empty()) {
            if ctx.entities.update_avatar(uid, avatar)? {
                task = Some(self.spawn_avatar_publish(event, uid, avatar.to_string()));
            }
        }

        ctx.entities.record_join(uid, event.group_id, event.date)?;

        Ok((
            MemberStatus::Processed {
                new_identity,
                avatar_published: task.is_some(),
            },
            task,
        ))
    }

    fn name_flagged(&self, member: &NewMember) -> bool {
        let ctx = self.ctx();
        let name = ctx.normalizer.normalize(&member.full_name(), true, false, false);
        let flagged = !name.is_empty() && ctx.classifier.classify_identity(member.id, TextKind::NameSpam, &name, false);
        if flagged {
            tracing::info!(target: "vigil::orchestrator", user_id = member.id, "name flagged");
        }
        flagged
    }

    async fn fetch_bio(&self, uid: i64) -> String {
        match self.ctx().transport.fetch_bio(uid).await {
            Ok(bio) => bio.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(target: "vigil::orchestrator", user_id = uid, error = %e, "bio lookup failed");
                String::new()
            }
        }
    }

    fn bio_flagged(&self, uid: i64, bio: &str) -> bool {
        let ctx = self.ctx();
        let bio = ctx.normalizer.normalize(bio, true, false, false);
        let flagged = !bio.is_empty() && ctx.classifier.classify_identity(uid, TextKind::BioSpam, &bio, false);
        if flagged {
            tracing::info!(target: "vigil::orchestrator", user_id = uid, "bio flagged");
        }
        flagged
    }

    /// Download the avatar and send it to the avatar receivers without holding any lock.
    fn spawn_avatar_publish(&self, event: &JoinEvent, uid: i64, avatar: String) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let gid = event.group_id;
        let mid = event.message_id;
        tokio::spawn(async move {
            let ctx = bus.context();
            let image = match ctx.transport.fetch_file(&avatar).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(target: "vigil::orchestrator", user_id = uid, error = %e, "avatar download failed");
                    return;
                }
            };
            let data = json!({"group_id": gid, "user_id": uid, "message_id": mid});
            let attachment = Attachment::new(format!("{}.jpg", uid), image);
            let to = ctx.config.avatar_receivers.clone();
            if let Err(e) = bus.emit(&to, "update", "avatar", data, Some(attachment)).await {
                tracing::warn!(target: "vigil::orchestrator", user_id = uid, error = %e, "avatar not shared");
            }
        })
    }
}
