//! Shared entity store: bad/exempt/white/trusted identities, admin rosters, identity
//! records, watch entries and declared messages.
//!
//! Each persisted section has its own lock and is saved inside that lock right after a
//! mutation changes it, so a crash never leaves a half-applied step behind. Declared
//! message ids are a processing window and live in memory only.

use crate::error::{VigilError, VigilResult};
use crate::persistence::{load_json, save_json, StateBackend};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

pub const BAD_IDS: &str = "bad_ids";
pub const EXCEPT_IDS: &str = "except_ids";
pub const WHITE_IDS: &str = "white_ids";
pub const TRUST_IDS: &str = "trust_ids";
pub const ADMIN_IDS: &str = "admin_ids";
pub const USER_IDS: &str = "user_ids";
pub const WATCH_IDS: &str = "watch_ids";

/// Every persisted entity section, in backup order.
pub const SECTION_NAMES: [&str; 7] = [
    BAD_IDS, EXCEPT_IDS, WHITE_IDS, TRUST_IDS, ADMIN_IDS, USER_IDS, WATCH_IDS,
];

/// Per-identity state observed from join events and peer score updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Reference of the last seen avatar (empty when none was seen).
    #[serde(default)]
    pub avatar: String,
    /// Group id → last join timestamp (unix seconds).
    #[serde(default)]
    pub join: BTreeMap<i64, i64>,
    /// Score source (lower-cased agent name) → contribution.
    #[serde(default)]
    pub score: BTreeMap<String, f64>,
}

/// Globally blacklisted users and channels (Class D).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BadIds {
    #[serde(default)]
    pub users: BTreeSet<i64>,
    #[serde(default)]
    pub channels: BTreeSet<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadKind {
    User,
    Channel,
}

impl BadKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" | "users" => Some(Self::User),
            "channel" | "channels" => Some(Self::Channel),
            _ => None,
        }
    }
}

/// Target of a `clear/<scope>` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    Bad,
    Except,
    User,
    Watch,
}

impl ClearScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "bad" => Some(Self::Bad),
            "except" => Some(Self::Except),
            "user" => Some(Self::User),
            "watch" => Some(Self::Watch),
            _ => None,
        }
    }
}

/// Point-in-time copy of the whole store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySnapshot {
    pub bad: BadIds,
    pub except: BTreeMap<String, BTreeSet<i64>>,
    pub white: BTreeSet<i64>,
    pub trust: BTreeMap<i64, BTreeSet<i64>>,
    pub admins: BTreeMap<i64, BTreeSet<i64>>,
    pub users: BTreeMap<i64, IdentityRecord>,
    pub watch: BTreeMap<String, BTreeMap<i64, i64>>,
    pub declared: BTreeMap<i64, BTreeSet<i64>>,
}

/// One persisted, lock-guarded section.
struct Section<T> {
    name: &'static str,
    value: RwLock<T>,
}

impl<T> Section<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    fn load(name: &'static str, backend: &dyn StateBackend) -> Self {
        let value = match load_json::<T>(backend, name) {
            Ok(Some(v)) => v,
            Ok(None) => T::default(),
            Err(e) => {
                tracing::warn!(target: "vigil::entities", section = name, error = %e, "section unreadable; starting empty");
                T::default()
            }
        };
        Self {
            name,
            value: RwLock::new(value),
        }
    }

    /// Read with a fallback when the lock is poisoned. Predicates use this so a
    /// poisoned section reads as "no signal".
    fn read_or<R>(&self, fallback: R, f: impl FnOnce(&T) -> R) -> R {
        match self.value.read() {
            Ok(guard) => f(&guard),
            Err(e) => {
                tracing::warn!(target: "vigil::entities", section = self.name, error = %e, "read on poisoned section");
                fallback
            }
        }
    }

    fn get(&self) -> VigilResult<T> {
        Ok(self.value.read()?.clone())
    }

    /// Apply `f`; when it reports a change, persist while still holding the write lock.
    fn update(&self, backend: &dyn StateBackend, f: impl FnOnce(&mut T) -> bool) -> VigilResult<bool> {
        let mut guard = self.value.write()?;
        let changed = f(&mut guard);
        if changed {
            save_json(backend, self.name, &*guard)?;
        }
        Ok(changed)
    }

    fn replace(&self, backend: &dyn StateBackend, blob: &[u8]) -> VigilResult<()> {
        let parsed: T = serde_json::from_slice(blob)?;
        let mut guard = self.value.write()?;
        *guard = parsed;
        save_json(backend, self.name, &*guard)
    }

    fn export(&self) -> VigilResult<Vec<u8>> {
        let guard = self.value.read()?;
        Ok(serde_json::to_vec(&*guard)?)
    }
}

/// Process-wide entity store.
pub struct EntityStore {
    backend: Arc<dyn StateBackend>,
    bot_ids: BTreeSet<i64>,
    score_threshold: f64,
    bad: Section<BadIds>,
    except: Section<BTreeMap<String, BTreeSet<i64>>>,
    white: Section<BTreeSet<i64>>,
    trust: Section<BTreeMap<i64, BTreeSet<i64>>>,
    admins: Section<BTreeMap<i64, BTreeSet<i64>>>,
    users: Section<BTreeMap<i64, IdentityRecord>>,
    watch: Section<BTreeMap<String, BTreeMap<i64, i64>>>,
    declared: RwLock<BTreeMap<i64, BTreeSet<i64>>>,
}

impl EntityStore {
    /// Load every section from `backend`. `bot_ids` are sibling bots (always Class E).
    pub fn open(backend: Arc<dyn StateBackend>, bot_ids: impl IntoIterator<Item = i64>, score_threshold: f64) -> Self {
        let b = backend.as_ref();
        Self {
            bad: Section::load(BAD_IDS, b),
            except: Section::load(EXCEPT_IDS, b),
            white: Section::load(WHITE_IDS, b),
            trust: Section::load(TRUST_IDS, b),
            admins: Section::load(ADMIN_IDS, b),
            users: Section::load(USER_IDS, b),
            watch: Section::load(WATCH_IDS, b),
            declared: RwLock::new(BTreeMap::new()),
            bot_ids: bot_ids.into_iter().collect(),
            score_threshold,
            backend,
        }
    }

    fn backend(&self) -> &dyn StateBackend {
        self.backend.as_ref()
    }

    // ---------------------------------------------------------------------
    // Bad / exempt / white / trusted sets
    // ---------------------------------------------------------------------

    pub fn add_bad(&self, kind: BadKind, id: i64) -> VigilResult<bool> {
        self.bad.update(self.backend(), |bad| match kind {
            BadKind::User => bad.users.insert(id),
            BadKind::Channel => bad.channels.insert(id),
        })
    }

    pub fn remove_bad(&self, kind: BadKind, id: i64) -> VigilResult<bool> {
        self.bad.update(self.backend(), |bad| match kind {
            BadKind::User => bad.users.remove(&id),
            BadKind::Channel => bad.channels.remove(&id),
        })
    }

    pub fn is_bad_channel(&self, cid: i64) -> bool {
        self.bad.read_or(false, |bad| bad.channels.contains(&cid))
    }

    /// Exempt `id` under an exemption kind (e.g. "long", "temp").
    pub fn add_except(&self, kind: &str, id: i64) -> VigilResult<bool> {
        self.except.update(self.backend(), |except| {
            except.entry(kind.to_string()).or_default().insert(id)
        })
    }

    pub fn remove_except(&self, kind: &str, id: i64) -> VigilResult<bool> {
        self.except.update(self.backend(), |except| {
            let Some(set) = except.get_mut(kind) else {
                return false;
            };
            let removed = set.remove(&id);
            if set.is_empty() {
                except.remove(kind);
            }
            removed
        })
    }

    /// True when `id` is exempted under any kind.
    pub fn is_exempt(&self, id: i64) -> bool {
        self.except.read_or(false, |except| except.values().any(|s| s.contains(&id)))
    }

    pub fn add_white(&self, uid: i64) -> VigilResult<bool> {
        self.white.update(self.backend(), |white| white.insert(uid))
    }

    pub fn remove_white(&self, uid: i64) -> VigilResult<bool> {
        self.white.update(self.backend(), |white| white.remove(&uid))
    }

    /// Replace the trusted set of a group.
    pub fn set_trusted(&self, gid: i64, ids: BTreeSet<i64>) -> VigilResult<bool> {
        self.trust.update(self.backend(), |trust| {
            if trust.get(&gid) == Some(&ids) {
                return false;
            }
            trust.insert(gid, ids);
            true
        })
    }

    // ---------------------------------------------------------------------
    // Admin rosters
    // ---------------------------------------------------------------------

    /// Replace the admin roster of a group.
    pub fn set_admins(&self, gid: i64, ids: BTreeSet<i64>) -> VigilResult<bool> {
        self.admins.update(self.backend(), |admins| {
            if admins.get(&gid) == Some(&ids) {
                return false;
            }
            admins.insert(gid, ids);
            true
        })
    }

    pub fn is_admin(&self, gid: i64, uid: i64) -> bool {
        self.admins
            .read_or(false, |admins| admins.get(&gid).is_some_and(|s| s.contains(&uid)))
    }

    /// Groups with a known roster.
    pub fn groups(&self) -> Vec<i64> {
        self.admins.read_or(Vec::new(), |admins| admins.keys().copied().collect())
    }

    // ---------------------------------------------------------------------
    // Personnel classes
    // ---------------------------------------------------------------------

    /// Class C: a group admin or a sibling bot.
    pub fn is_class_c(&self, gid: i64, uid: i64) -> bool {
        self.bot_ids.contains(&uid) || self.is_admin(gid, uid)
    }

    /// Class D: a bad user that is not exempted. Exemption takes precedence.
    pub fn is_class_d_user(&self, uid: i64) -> bool {
        if self.is_exempt(uid) {
            return false;
        }
        self.bad.read_or(false, |bad| bad.users.contains(&uid))
    }

    /// Class E: a sibling bot or an identity trusted in any group.
    pub fn is_class_e_user(&self, uid: i64) -> bool {
        if self.bot_ids.contains(&uid) {
            return true;
        }
        self.trust.read_or(false, |trust| trust.values().any(|s| s.contains(&uid)))
    }

    /// Class E or explicitly whitelisted.
    pub fn is_white_user(&self, uid: i64) -> bool {
        self.is_class_e_user(uid) || self.white.read_or(false, |white| white.contains(&uid))
    }

    // ---------------------------------------------------------------------
    // Identity records
    // ---------------------------------------------------------------------

    /// Create the record for `uid` if it does not exist yet. Returns true when created.
    pub fn init_identity(&self, uid: i64) -> VigilResult<bool> {
        self.users.update(self.backend(), |users| {
            if users.contains_key(&uid) {
                return false;
            }
            users.insert(uid, IdentityRecord::default());
            true
        })
    }

    pub fn identity(&self, uid: i64) -> Option<IdentityRecord> {
        self.users.read_or(None, |users| users.get(&uid).cloned())
    }

    /// Store a new avatar reference. Returns true when it differs from the stored one.
    pub fn update_avatar(&self, uid: i64, avatar: &str) -> VigilResult<bool> {
        self.users.update(self.backend(), |users| {
            let record = users.entry(uid).or_default();
            if record.avatar == avatar {
                return false;
            }
            record.avatar = avatar.to_string();
            true
        })
    }

    pub fn record_join(&self, uid: i64, gid: i64, at: i64) -> VigilResult<bool> {
        self.users.update(self.backend(), |users| {
            let record = users.entry(uid).or_default();
            record.join.insert(gid, at) != Some(at)
        })
    }

    /// Record a score contribution from `source`.
    pub fn set_score(&self, uid: i64, source: &str, score: f64) -> VigilResult<bool> {
        let source = source.to_lowercase();
        self.users.update(self.backend(), |users| {
            let record = users.entry(uid).or_default();
            record.score.insert(source, score) != Some(score)
        })
    }

    /// Summed score of `uid`. With `high_only`, scores under the threshold read as 0.
    /// Class E identities always score 0.
    pub fn score_of(&self, uid: i64, high_only: bool) -> f64 {
        if self.is_class_e_user(uid) {
            return 0.0;
        }
        let score = self
            .users
            .read_or(0.0, |users| users.get(&uid).map(|r| r.score.values().sum()).unwrap_or(0.0));
        if high_only && score < self.score_threshold {
            return 0.0;
        }
        score
    }

    // ---------------------------------------------------------------------
    // Watch entries
    // ---------------------------------------------------------------------

    /// Put `uid` under watch for `category` until `until`, replacing any previous entry.
    pub fn watch(&self, uid: i64, category: &str, until: i64) -> VigilResult<bool> {
        self.watch.update(self.backend(), |watch| {
            watch.entry(category.to_string()).or_default().insert(uid, until) != Some(until)
        })
    }

    /// Pure timestamp comparison; Class E identities are never watched.
    pub fn is_watched(&self, uid: i64, category: &str, now: i64) -> bool {
        if self.is_class_e_user(uid) {
            return false;
        }
        let until = self.watch.read_or(0, |watch| {
            watch.get(category).and_then(|m| m.get(&uid)).copied().unwrap_or(0)
        });
        now < until
    }

    // ---------------------------------------------------------------------
    // Declared messages
    // ---------------------------------------------------------------------

    /// Mark a message as handled by a peer. Returns true when newly declared.
    pub fn declare(&self, gid: i64, mid: i64) -> VigilResult<bool> {
        let mut declared = self.declared.write()?;
        Ok(declared.entry(gid).or_default().insert(mid))
    }

    pub fn is_declared(&self, gid: i64, mid: i64) -> bool {
        match self.declared.read() {
            Ok(declared) => declared.get(&gid).is_some_and(|s| s.contains(&mid)),
            Err(e) => {
                tracing::warn!(target: "vigil::entities", error = %e, "declared set poisoned");
                false
            }
        }
    }

    /// Close the current processing window.
    pub fn reset_declared(&self) -> VigilResult<()> {
        self.declared.write()?.clear();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Bulk operations
    // ---------------------------------------------------------------------

    /// Apply a `clear/<scope>` command. `kind` narrows the scope ("all" clears everything
    /// in it). Unknown kinds change nothing.
    pub fn clear(&self, scope: ClearScope, kind: &str) -> VigilResult<bool> {
        let backend = self.backend();
        match scope {
            ClearScope::Bad => self.bad.update(backend, |bad| match kind {
                "users" => !std::mem::take(&mut bad.users).is_empty(),
                "channels" => !std::mem::take(&mut bad.channels).is_empty(),
                "all" => std::mem::take(bad) != BadIds::default(),
                _ => false,
            }),
            ClearScope::Except => self.except.update(backend, |except| match kind {
                "all" => !std::mem::take(except).is_empty(),
                other => except.remove(other).is_some(),
            }),
            ClearScope::User => self.users.update(backend, |users| match kind {
                "all" => !std::mem::take(users).is_empty(),
                _ => false,
            }),
            ClearScope::Watch => self.watch.update(backend, |watch| match kind {
                "all" => !std::mem::take(watch).is_empty(),
                other => watch.remove(other).is_some(),
            }),
        }
    }

    pub fn snapshot(&self) -> VigilResult<EntitySnapshot> {
        Ok(EntitySnapshot {
            bad: self.bad.get()?,
            except: self.except.get()?,
            white: self.white.get()?,
            trust: self.trust.get()?,
            admins: self.admins.get()?,
            users: self.users.get()?,
            watch: self.watch.get()?,
            declared: self.declared.read()?.clone(),
        })
    }

    /// Serialized section, as persisted.
    pub fn export(&self, name: &str) -> VigilResult<Vec<u8>> {
        match name {
            BAD_IDS => self.bad.export(),
            EXCEPT_IDS => self.except.export(),
            WHITE_IDS => self.white.export(),
            TRUST_IDS => self.trust.export(),
            ADMIN_IDS => self.admins.export(),
            USER_IDS => self.users.export(),
            WATCH_IDS => self.watch.export(),
            other => Err(VigilError::Persistence(format!("unknown section: {}", other))),
        }
    }

    /// Replace one section from a serialized blob (rollback). The blob must parse
    /// completely; a malformed blob leaves the section untouched.
    pub fn restore(&self, name: &str, blob: &[u8]) -> VigilResult<()> {
        let backend = self.backend();
        match name {
            BAD_IDS => self.bad.replace(backend, blob),
            EXCEPT_IDS => self.except.replace(backend, blob),
            WHITE_IDS => self.white.replace(backend, blob),
            TRUST_IDS => self.trust.replace(backend, blob),
            ADMIN_IDS => self.admins.replace(backend, blob),
            USER_IDS => self.users.replace(backend, blob),
            WATCH_IDS => self.watch.replace(backend, blob),
            other => Err(VigilError::Persistence(format!("unknown section: {}", other))),
        }
    }
}
