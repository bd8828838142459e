//! Vigil: moderation agent core.
//! Text normalization, categorized regex rules with hit counters, the spam classifier,
//! the shared entity store, the encrypted inter-agent signal bus and the join workflow.

pub mod bus;
pub mod classifier;
pub mod config;
pub mod context;
pub mod entities;
pub mod error;
pub mod maintenance;
pub mod normalizer;
pub mod orchestrator;
pub mod persistence;
pub mod rules;
pub mod transport;

pub use bus::{BusCipher, Dispatch, Envelope, Route, SignalBus};
pub use classifier::{Classifier, EmojiKind, EmojiPolicy, TextKind, Trigger, Verdict};
pub use config::{EmojiConfig, VigilConfig};
pub use context::AgentContext;
pub use entities::{BadKind, ClearScope, EntitySnapshot, EntityStore, IdentityRecord};
pub use error::{TransportError, VigilError, VigilResult};
pub use maintenance::{backup_all, report_rule_counts, spawn_maintenance};
pub use normalizer::{PassThrough, ScriptConverter, SpecialTable, TextNormalizer};
pub use orchestrator::{BatchReport, JoinEvent, JoinOrchestrator, MemberOutcome, MemberStatus, NewMember, SkipReason};
pub use persistence::{MemoryBackend, SledBackend, StateBackend};
pub use rules::{PatternCounts, RuleDiff, RuleHit, RuleStore};
pub use transport::{Attachment, GroupRoster, Packet, Transport};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
