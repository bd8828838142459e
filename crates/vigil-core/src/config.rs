//! Agent configuration.
//!
//! Loaded with the `config` crate: built-in defaults, then an optional TOML file, then
//! `VIGIL__*` environment variables. Change thresholds and peers without code edits.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | agent_name | AVATAR | Name this agent answers to on the signal bus. |
//! | data_dir | ./data | Directory holding the sled state database. |
//! | lang | cmn-Hans | Locale; a `Hans` locale enables traditional→simplified folding. |
//! | normalize | true | Master switch for substitution, NFKC and script folding. |
//! | bus_key | (none) | 64 hex chars: the pre-shared AES-256-GCM key. |
//! | bus_token_ttl_secs | (none) | Reject envelopes older than this. |
//! | nospam_id | (none) | NOSPAM identity; its admin presence enables name/bio checks. |
//! | bot_ids | [] | Sibling bot identities (always trusted). |
//! | score_threshold | 3.0 | Minimum summed score for a "high score" identity. |

use crate::error::{VigilError, VigilResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Path used when `VIGIL_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "config/vigil.toml";

fn default_agent_name() -> String {
    "AVATAR".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_lang() -> String {
    "cmn-Hans".to_string()
}

fn default_true() -> bool {
    true
}

fn default_avatar_receivers() -> Vec<String> {
    vec!["NOSPAM".to_string()]
}

fn default_backup_receiver() -> String {
    "BACKUP".to_string()
}

fn default_regex_receiver() -> String {
    "REGEX".to_string()
}

fn default_score_threshold() -> f64 {
    3.0
}

fn default_day_secs() -> u64 {
    86_400
}

/// Emoji thresholds and glyph sets used by the emoji signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmojiConfig {
    /// Glyphs counted as spam emoji.
    pub set: Vec<String>,
    /// Glyphs never counted even when present in `set`.
    pub protect: Vec<String>,
    /// Advertisement: any single glyph repeated at least this often.
    pub ad_single: usize,
    /// Advertisement: total spam emoji count.
    pub ad_total: usize,
    /// "Many emoji": total spam emoji count.
    pub many: usize,
    /// Watch bait: any single glyph repeated at least this often.
    pub wb_single: usize,
    /// Watch bait: total spam emoji count.
    pub wb_total: usize,
}

impl Default for EmojiConfig {
    fn default() -> Self {
        let set = [
            "💰", "💵", "💴", "💶", "💷", "💸", "💲", "🤑", "💎", "🎁", "🎉", "🔥", "⭐", "🌟",
            "✨", "⚡", "💯", "✅", "☑", "✔", "❗", "❕", "‼", "⁉", "❓", "👉", "👈", "👆",
            "👇", "☝", "📢", "📣", "🔔", "📱", "📲", "☎", "📞", "💬", "🆕", "🆓", "🔞", "💋",
            "❤", "💕", "💖", "💗", "🧧", "🀄", "🎰", "🎲", "🃏",
        ];
        Self {
            set: set.iter().map(|s| s.to_string()).collect(),
            protect: Vec::new(),
            ad_single: 15,
            ad_total: 30,
            many: 15,
            wb_single: 10,
            wb_total: 15,
        }
    }
}

/// Full agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_true")]
    pub normalize: bool,
    /// Hex-encoded 32-byte key shared by every agent on the bus.
    #[serde(default)]
    pub bus_key: Option<String>,
    #[serde(default)]
    pub bus_token_ttl_secs: Option<u64>,
    #[serde(default)]
    pub nospam_id: Option<i64>,
    #[serde(default)]
    pub bot_ids: Vec<i64>,
    #[serde(default = "default_avatar_receivers")]
    pub avatar_receivers: Vec<String>,
    #[serde(default = "default_backup_receiver")]
    pub backup_receiver: String,
    #[serde(default = "default_regex_receiver")]
    pub regex_receiver: String,
    /// Rule categories registered on top of the built-in set.
    #[serde(default)]
    pub extra_categories: Vec<String>,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    #[serde(default)]
    pub emoji: EmojiConfig,
    #[serde(default = "default_day_secs")]
    pub backup_interval_secs: u64,
    #[serde(default = "default_day_secs")]
    pub declared_reset_secs: u64,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            version: default_version(),
            data_dir: default_data_dir(),
            lang: default_lang(),
            normalize: true,
            bus_key: None,
            bus_token_ttl_secs: None,
            nospam_id: None,
            bot_ids: Vec::new(),
            avatar_receivers: default_avatar_receivers(),
            backup_receiver: default_backup_receiver(),
            regex_receiver: default_regex_receiver(),
            extra_categories: Vec::new(),
            score_threshold: default_score_threshold(),
            emoji: EmojiConfig::default(),
            backup_interval_secs: default_day_secs(),
            declared_reset_secs: default_day_secs(),
        }
    }
}

impl VigilConfig {
    /// Load config from file and environment. Precedence: env > `VIGIL_CONFIG` path (or
    /// `config/vigil.toml`) > defaults.
    pub fn load() -> VigilResult<Self> {
        let config_path =
            std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(Path::new(&config_path))
    }

    /// Load config from a specific TOML path, still honoring `VIGIL__*` overrides.
    /// A missing file is not an error.
    pub fn load_from_path(path: &Path) -> VigilResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("bot_ids")
                    .with_list_parse_key("avatar_receivers")
                    .with_list_parse_key("extra_categories"),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    /// Parse a TOML document directly (no environment overlay).
    pub fn from_toml_str(raw: &str) -> VigilResult<Self> {
        toml::from_str(raw).map_err(|e| VigilError::Config(e.to_string()))
    }

    /// Decode `bus_key` into the 32-byte AES key.
    pub fn bus_key_bytes(&self) -> VigilResult<[u8; 32]> {
        let raw = self
            .bus_key
            .as_deref()
            .map(|k| k.trim().replace([' ', '\n'], ""))
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VigilError::InvalidKey("bus_key is not set".to_string()))?;
        let bytes = hex::decode(&raw).map_err(|e| VigilError::InvalidKey(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| VigilError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))
    }

    /// True when the locale asks for traditional→simplified folding.
    pub fn folds_script(&self) -> bool {
        self.normalize && self.lang.contains("Hans")
    }

    /// Directory of the sled state database.
    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("vigil_state")
    }
}
