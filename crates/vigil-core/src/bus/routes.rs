//! Inbound route table: which sender may ask for what.

use crate::entities::ClearScope;
use serde_json::Value;

/// Peer agents that report bad identities, declared messages and scores.
const PEERS: [&str; 7] = ["CLEAN", "LANG", "LONG", "NOFLOOD", "NOPORN", "NOSPAM", "RECHECK"];

/// Handler selected for an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    AddBad,
    AddExcept,
    AddWhite,
    AddWatch,
    RemoveBad,
    RemoveExcept,
    RemoveWhite,
    Declare,
    UpdateScore,
    Refresh,
    BackupNow,
    Rollback,
    Clear(ClearScope),
    RegexUpdate,
    RegexCountAsk,
    VersionAsk,
}

impl Route {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddBad => "add/bad",
            Self::AddExcept => "add/except",
            Self::AddWhite => "add/white",
            Self::AddWatch => "add/watch",
            Self::RemoveBad => "remove/bad",
            Self::RemoveExcept => "remove/except",
            Self::RemoveWhite => "remove/white",
            Self::Declare => "update/declare",
            Self::UpdateScore => "update/score",
            Self::Refresh => "update/refresh",
            Self::BackupNow => "backup/now",
            Self::Rollback => "backup/rollback",
            Self::Clear(ClearScope::Bad) => "clear/bad",
            Self::Clear(ClearScope::Except) => "clear/except",
            Self::Clear(ClearScope::User) => "clear/user",
            Self::Clear(ClearScope::Watch) => "clear/watch",
            Self::RegexUpdate => "regex/update",
            Self::RegexCountAsk => "regex/count",
            Self::VersionAsk => "version/ask",
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Select the handler for `(sender, action, type)`. `None` means "not for us": the
/// envelope is dropped without error.
pub fn route(sender: &str, action: &str, action_type: &str, data: &Value) -> Option<Route> {
    match (sender, action, action_type) {
        ("CAPTCHA", "update", "declare") => Some(Route::Declare),

        (peer, "add", "bad") if PEERS.contains(&peer) => Some(Route::AddBad),
        (peer, "update", "declare") if PEERS.contains(&peer) => Some(Route::Declare),
        (peer, "update", "score") if PEERS.contains(&peer) => Some(Route::UpdateScore),

        ("HIDE", "version", "ask") => Some(Route::VersionAsk),

        ("MANAGE", "add", "bad") => Some(Route::AddBad),
        ("MANAGE", "add", "except") => Some(Route::AddExcept),
        ("MANAGE", "add", "white") => Some(Route::AddWhite),
        ("MANAGE", "backup", "now") => Some(Route::BackupNow),
        ("MANAGE", "backup", "rollback") => Some(Route::Rollback),
        ("MANAGE", "clear", scope) => ClearScope::parse(scope).map(Route::Clear),
        ("MANAGE", "remove", "bad") => Some(Route::RemoveBad),
        ("MANAGE", "remove", "except") => Some(Route::RemoveExcept),
        ("MANAGE", "remove", "white") => Some(Route::RemoveWhite),
        ("MANAGE", "update", "refresh") => Some(Route::Refresh),

        ("REGEX", "regex", "update") => Some(Route::RegexUpdate),
        ("REGEX", "regex", "count") if data.as_str() == Some("ask") => Some(Route::RegexCountAsk),

        ("USER", "remove", "bad") => Some(Route::RemoveBad),

        ("WATCH", "add", "watch") => Some(Route::AddWatch),

        _ => None,
    }
}
