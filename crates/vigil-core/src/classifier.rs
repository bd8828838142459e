//! Spam classifier: combines rule-category hits and emoji frequency into decisions.
//!
//! Ban-worthy text needs a direct "ban" hit or a pair of weaker signals:
//!
//! | first signal            | second signal                    |
//! |-------------------------|----------------------------------|
//! | "ad" hit                | contact info ("con"/"iml"/"pho") |
//! | advertisement emoji     | contact info                     |
//! | ad letter ("ada".."adz")| contact info                     |
//! | ad letter               | advertisement emoji              |
//! | ad letter               | a second, different ad letter    |
//!
//! Names are held to nm ∪ bio ∪ ban scrutiny, bios to bio ∪ ban. Trusted identities
//! short-circuit to "not spam" before any rule is evaluated, so they never count hits.

use crate::config::EmojiConfig;
use crate::entities::EntityStore;
use crate::rules::{RuleHit, RuleStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Categories that count as contact information.
const CONTACT_CATEGORIES: [&str; 3] = ["con", "iml", "pho"];

/// Field being judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    NameSpam,
    BioSpam,
    BanWorthy,
}

/// Emoji-frequency signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmojiKind {
    Advertisement,
    Many,
    WatchBait,
}

/// Which combination fired.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Direct hit in "ban", "bio" or "nm".
    Rule(RuleHit),
    AdWithContact { ad: RuleHit, contact: RuleHit },
    EmojiWithContact { contact: RuleHit },
    AdLetterWithContact { letter: char, contact: RuleHit },
    AdLetterWithEmoji { letter: char },
    TwoAdLetters { first: char, second: char },
}

impl Trigger {
    /// Short diagnostic tag, e.g. `ban`, `ad+con`, `adb+emoji`.
    pub fn tag(&self) -> String {
        match self {
            Self::Rule(hit) => hit.category.clone(),
            Self::AdWithContact { contact, .. } => format!("ad+{}", contact.category),
            Self::EmojiWithContact { contact } => format!("emoji+{}", contact.category),
            Self::AdLetterWithContact { letter, contact } => format!("ad{}+{}", letter, contact.category),
            Self::AdLetterWithEmoji { letter } => format!("ad{}+emoji", letter),
            Self::TwoAdLetters { first, second } => format!("ad{}+ad{}", first, second),
        }
    }
}

/// Decision plus diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub spam: bool,
    /// Set when the subject was trusted and no rule ran.
    pub trusted: bool,
    pub trigger: Option<Trigger>,
}

impl Verdict {
    fn clean() -> Self {
        Self {
            spam: false,
            trusted: false,
            trigger: None,
        }
    }

    fn trusted() -> Self {
        Self {
            spam: false,
            trusted: true,
            trigger: None,
        }
    }

    fn from_trigger(trigger: Option<Trigger>) -> Self {
        Self {
            spam: trigger.is_some(),
            trusted: false,
            trigger,
        }
    }
}

/// Spam-emoji counting with per-kind thresholds.
#[derive(Debug, Clone)]
pub struct EmojiPolicy {
    glyphs: BTreeSet<String>,
    ad_single: usize,
    ad_total: usize,
    many: usize,
    wb_single: usize,
    wb_total: usize,
}

impl EmojiPolicy {
    pub fn from_config(cfg: &EmojiConfig) -> Self {
        let protect: BTreeSet<&str> = cfg.protect.iter().map(String::as_str).collect();
        Self {
            glyphs: cfg
                .set
                .iter()
                .filter(|g| !g.is_empty() && !protect.contains(g.as_str()))
                .cloned()
                .collect(),
            ad_single: cfg.ad_single,
            ad_total: cfg.ad_total,
            many: cfg.many,
            wb_single: cfg.wb_single,
            wb_total: cfg.wb_total,
        }
    }

    /// Occurrences of each spam glyph in `text`. A glyph contained in another glyph that
    /// is also present is dropped so composite emoji are not counted twice.
    pub fn counts(&self, text: &str) -> BTreeMap<String, usize> {
        let present: Vec<&String> = self.glyphs.iter().filter(|g| text.contains(g.as_str())).collect();
        present
            .iter()
            .filter(|g| !present.iter().any(|other| other != *g && other.contains(g.as_str())))
            .map(|g| ((*g).clone(), text.matches(g.as_str()).count()))
            .collect()
    }

    pub fn signal(&self, kind: EmojiKind, text: &str) -> bool {
        let counts = self.counts(text);
        let total: usize = counts.values().sum();
        let max = counts.values().copied().max().unwrap_or(0);
        match kind {
            EmojiKind::Advertisement => (max > 0 && max >= self.ad_single) || (total > 0 && total >= self.ad_total),
            EmojiKind::Many => total > 0 && total >= self.many,
            EmojiKind::WatchBait => (max > 0 && max >= self.wb_single) || (total > 0 && total >= self.wb_total),
        }
    }
}

/// The classifier. Cheap to share behind an `Arc`.
pub struct Classifier {
    rules: Arc<RuleStore>,
    entities: Arc<EntityStore>,
    emoji: EmojiPolicy,
}

impl Classifier {
    pub fn new(rules: Arc<RuleStore>, entities: Arc<EntityStore>, emoji: EmojiPolicy) -> Self {
        Self {
            rules,
            entities,
            emoji,
        }
    }

    /// Match one category; errors (unknown category, poisoned table) read as "no hit".
    fn hit(&self, category: &str, text: &str, ocr: bool) -> Option<RuleHit> {
        match self.rules.match_and_count(category, text, ocr) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(target: "vigil::classifier", category, error = %e, "rule check failed");
                None
            }
        }
    }

    /// First contact-information hit ("con", then "iml", then "pho").
    pub fn contact_hit(&self, text: &str, ocr: bool) -> Option<RuleHit> {
        CONTACT_CATEGORIES.iter().find_map(|c| self.hit(c, text, ocr))
    }

    /// First advertisement letter whose "ad" + letter category matches, skipping
    /// `already_matched`.
    pub fn detect_advertisement(&self, text: &str, ocr: bool, already_matched: Option<char>) -> Option<char> {
        if text.is_empty() {
            return None;
        }
        ('a'..='z')
            .filter(|&c| Some(c) != already_matched)
            .find(|c| self.hit(&format!("ad{}", c), text, ocr).is_some())
    }

    pub fn emoji_signal(&self, kind: EmojiKind, text: &str) -> bool {
        self.emoji.signal(kind, text)
    }

    fn ban_trigger(&self, text: &str, ocr: bool) -> Option<Trigger> {
        if let Some(hit) = self.hit("ban", text, ocr) {
            return Some(Trigger::Rule(hit));
        }

        let ad = self.hit("ad", text, ocr);
        let contact = self.contact_hit(text, ocr);
        if let (Some(ad), Some(contact)) = (&ad, &contact) {
            return Some(Trigger::AdWithContact {
                ad: ad.clone(),
                contact: contact.clone(),
            });
        }

        let emoji = self.emoji_signal(EmojiKind::Advertisement, text);
        if let (true, Some(contact)) = (emoji, &contact) {
            return Some(Trigger::EmojiWithContact {
                contact: contact.clone(),
            });
        }

        let first = self.detect_advertisement(text, ocr, None)?;
        if let Some(contact) = contact {
            return Some(Trigger::AdLetterWithContact { letter: first, contact });
        }
        if emoji {
            return Some(Trigger::AdLetterWithEmoji { letter: first });
        }

        let second = self.detect_advertisement(text, ocr, Some(first))?;
        Some(Trigger::TwoAdLetters { first, second })
    }

    fn trigger(&self, kind: TextKind, text: &str, ocr: bool) -> Option<Trigger> {
        match kind {
            TextKind::BanWorthy => self.ban_trigger(text, ocr),
            TextKind::BioSpam => self
                .hit("bio", text, ocr)
                .map(Trigger::Rule)
                .or_else(|| self.ban_trigger(text, ocr)),
            TextKind::NameSpam => self
                .hit("nm", text, ocr)
                .or_else(|| self.hit("bio", text, ocr))
                .map(Trigger::Rule)
                .or_else(|| self.ban_trigger(text, ocr)),
        }
    }

    /// Full assessment. When `subject` is trusted (Class E or whitelisted) no rule runs.
    pub fn assess(&self, subject: Option<i64>, kind: TextKind, text: &str, ocr: bool) -> Verdict {
        if subject.is_some_and(|uid| self.entities.is_white_user(uid)) {
            return Verdict::trusted();
        }
        if text.is_empty() {
            return Verdict::clean();
        }
        let verdict = Verdict::from_trigger(self.trigger(kind, text, ocr));
        if let Some(trigger) = &verdict.trigger {
            tracing::debug!(target: "vigil::classifier", ?kind, subject, trigger = %trigger.tag(), "text flagged");
        }
        verdict
    }

    /// Binary decision for anonymous text.
    pub fn classify(&self, kind: TextKind, text: &str, ocr: bool) -> bool {
        self.assess(None, kind, text, ocr).spam
    }

    /// Binary decision for text authored by `uid`.
    pub fn classify_identity(&self, uid: i64, kind: TextKind, text: &str, ocr: bool) -> bool {
        self.assess(Some(uid), kind, text, ocr).spam
    }
}
