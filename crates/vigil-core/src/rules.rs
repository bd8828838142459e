//! Rule store: category-keyed regex rules with persisted hit counters.
//!
//! Each category is an ordered rule table behind its own mutex, so classification on
//! one category never blocks another while a single category's
//! match → increment → persist sequence stays atomic.
//!
//! Rule patterns may carry inline comment groups `(?# ... )`. The regex engine does not
//! understand them, so they are stripped before compilation; a `(?# nocr)` comment marks
//! the rule as exempt from OCR-derived text.

use crate::error::{VigilError, VigilResult};
use crate::persistence::{load_json, save_json, StateBackend};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

static WHITESPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s{2,}").expect("whitespace pattern is valid"));

static COMMENT_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\?#([^)]*)\)").expect("comment pattern is valid"));

/// Comment text that exempts a rule from OCR input.
const OCR_EXEMPT_MARK: &str = "nocr";

/// Built-in categories: direct ("ban", "bio", "nm"), contact info ("con", "iml", "pho"),
/// advertisement ("ad" plus the 26 single-letter subcategories) and substitution tables.
pub fn default_categories() -> Vec<String> {
    let mut out: Vec<String> = ["ad", "ban", "bio", "con", "iml", "nm", "pho", "spc", "spe"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    out.extend(('a'..='z').map(|c| format!("ad{}", c)));
    out
}

/// Blob name of a category's rule table.
pub fn table_blob_name(category: &str) -> String {
    format!("rules/{}", category)
}

/// A compiled rule and its counters.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: String,
    regex: Regex,
    ocr_exempt: bool,
    hits: u64,
    reported: u64,
}

impl Rule {
    /// Compile `pattern` (case-insensitive, dot matches newline, multi-line).
    pub fn compile(category: &str, pattern: &str) -> VigilResult<Self> {
        let ocr_exempt = COMMENT_GROUP
            .captures_iter(pattern)
            .any(|c| c[1].trim() == OCR_EXEMPT_MARK);
        let source = COMMENT_GROUP.replace_all(pattern, "");
        let regex = RegexBuilder::new(&source)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .multi_line(true)
            .build()
            .map_err(|e| VigilError::InvalidPattern {
                category: category.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            ocr_exempt,
            hits: 0,
            reported: 0,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn ocr_exempt(&self) -> bool {
        self.ocr_exempt
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}

/// Persisted form of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub pattern: String,
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub reported: u64,
}

/// A `{pattern: count}` object read in document order. Evaluation order is table
/// order, so the entries must not be re-sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternCounts(pub Vec<(String, u64)>);

impl PatternCounts {
    pub fn patterns(self) -> Vec<String> {
        self.0.into_iter().map(|(pattern, _)| pattern).collect()
    }
}

impl<'de> Deserialize<'de> for PatternCounts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CountsVisitor;

        impl<'de> Visitor<'de> for CountsVisitor {
            type Value = PatternCounts;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of pattern to hit count")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((pattern, hits)) = map.next_entry::<String, u64>()? {
                    entries.push((pattern, hits));
                }
                Ok(PatternCounts(entries))
            }
        }

        deserializer.deserialize_map(CountsVisitor)
    }
}

/// Accepted on-disk / on-wire table shapes: the ordered record list this store writes,
/// or a plain `{pattern: count}` mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StoredTable {
    Ordered(Vec<RuleRecord>),
    Counts(PatternCounts),
}

impl StoredTable {
    fn into_records(self) -> Vec<RuleRecord> {
        match self {
            Self::Ordered(records) => records,
            Self::Counts(PatternCounts(entries)) => entries
                .into_iter()
                .map(|(pattern, hits)| RuleRecord { pattern, hits, reported: 0 })
                .collect(),
        }
    }
}

/// Successful match of a rule against normalized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    pub category: String,
    pub pattern: String,
    /// Counter value after this match.
    pub hits: u64,
    /// The matched substring of the attempted text form.
    pub matched: String,
}

/// Summary of a pattern replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    pub added: usize,
    pub removed: usize,
    pub kept: usize,
}

#[derive(Debug, Default)]
struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    fn from_records(category: &str, records: Vec<RuleRecord>) -> Self {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(records.len());
        for record in records {
            if !seen.insert(record.pattern.clone()) {
                continue;
            }
            match Rule::compile(category, &record.pattern) {
                Ok(mut rule) => {
                    rule.hits = record.hits;
                    rule.reported = record.reported.min(record.hits);
                    rules.push(rule);
                }
                Err(e) => {
                    tracing::warn!(target: "vigil::rules", category, error = %e, "skipping rule");
                }
            }
        }
        Self { rules }
    }

    fn records(&self) -> Vec<RuleRecord> {
        self.rules
            .iter()
            .map(|r| RuleRecord {
                pattern: r.pattern.clone(),
                hits: r.hits,
                reported: r.reported,
            })
            .collect()
    }

    fn find(&self, text: &str, ocr_mode: bool) -> Option<(usize, String)> {
        self.rules.iter().enumerate().find_map(|(i, rule)| {
            if ocr_mode && rule.ocr_exempt {
                return None;
            }
            rule.regex.find(text).map(|m| (i, m.as_str().to_string()))
        })
    }
}

/// Process-wide rule store.
pub struct RuleStore {
    tables: DashMap<String, Arc<Mutex<RuleTable>>>,
    backend: Arc<dyn StateBackend>,
}

impl RuleStore {
    /// Register `categories` and load their persisted tables. A missing or unreadable
    /// blob yields an empty category.
    pub fn open(backend: Arc<dyn StateBackend>, categories: impl IntoIterator<Item = String>) -> Self {
        let store = Self {
            tables: DashMap::new(),
            backend,
        };
        for category in categories {
            store.register(&category);
        }
        store
    }

    /// Register a category, loading its table. Returns false if it was already registered.
    pub fn register(&self, category: &str) -> bool {
        if self.tables.contains_key(category) {
            return false;
        }
        let records = match load_json::<StoredTable>(self.backend.as_ref(), &table_blob_name(category)) {
            Ok(Some(stored)) => stored.into_records(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(target: "vigil::rules", category, error = %e, "rule table unreadable; starting empty");
                Vec::new()
            }
        };
        let table = RuleTable::from_records(category, records);
        tracing::debug!(target: "vigil::rules", category, rules = table.rules.len(), "category registered");
        self.tables
            .insert(category.to_string(), Arc::new(Mutex::new(table)));
        true
    }

    pub fn is_registered(&self, category: &str) -> bool {
        self.tables.contains_key(category)
    }

    /// Registered categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut out: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }

    fn table(&self, category: &str) -> VigilResult<Arc<Mutex<RuleTable>>> {
        self.tables
            .get(category)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| VigilError::UnknownCategory(category.to_string()))
    }

    fn persist(&self, category: &str, table: &RuleTable) -> VigilResult<()> {
        save_json(self.backend.as_ref(), &table_blob_name(category), &table.records())
    }

    /// Match `text` against `category` and count the first matching rule.
    ///
    /// Runs of two or more whitespace characters collapse to one space for the first
    /// attempt; if nothing matches and the text contains whitespace, a second attempt
    /// runs with all whitespace removed. Under `ocr_mode`, OCR-exempt rules are skipped.
    pub fn match_and_count(&self, category: &str, text: &str, ocr_mode: bool) -> VigilResult<Option<RuleHit>> {
        let table = self.table(category)?;
        if text.is_empty() {
            return Ok(None);
        }

        let collapsed = WHITESPACE_RUN.replace_all(text, " ");
        let stripped: String = collapsed.chars().filter(|c| !c.is_whitespace()).collect();
        let forms: Vec<&str> = if stripped == collapsed {
            vec![collapsed.as_ref()]
        } else {
            vec![collapsed.as_ref(), stripped.as_str()]
        };

        let mut guard = table.lock()?;
        let Some((index, matched)) = forms.iter().find_map(|form| guard.find(form, ocr_mode)) else {
            return Ok(None);
        };

        let rule = &mut guard.rules[index];
        rule.hits += 1;
        let hit = RuleHit {
            category: category.to_string(),
            pattern: rule.pattern.clone(),
            hits: rule.hits,
            matched,
        };

        if let Err(e) = self.persist(category, &guard) {
            tracing::warn!(target: "vigil::rules", category, error = %e, "hit count not persisted");
        }
        tracing::debug!(target: "vigil::rules", category, pattern = %hit.pattern, hits = hit.hits, "rule hit");
        Ok(Some(hit))
    }

    /// Replace a category's patterns. Surviving patterns keep their counters, new ones
    /// start at zero, and the table takes the order of `patterns`.
    pub fn replace_patterns(&self, category: &str, patterns: &[String]) -> VigilResult<RuleDiff> {
        let table = self.table(category)?;
        let mut guard = table.lock()?;

        let mut previous: BTreeMap<String, Rule> = guard
            .rules
            .drain(..)
            .map(|r| (r.pattern.clone(), r))
            .collect();
        let mut diff = RuleDiff::default();
        let mut seen = HashSet::new();

        for pattern in patterns {
            if !seen.insert(pattern.as_str()) {
                continue;
            }
            if let Some(rule) = previous.remove(pattern) {
                guard.rules.push(rule);
                diff.kept += 1;
                continue;
            }
            match Rule::compile(category, pattern) {
                Ok(rule) => {
                    guard.rules.push(rule);
                    diff.added += 1;
                }
                Err(e) => {
                    tracing::warn!(target: "vigil::rules", category, error = %e, "rejected new rule");
                }
            }
        }
        diff.removed = previous.len();

        self.persist(category, &guard)?;
        tracing::info!(
            target: "vigil::rules",
            category,
            added = diff.added,
            removed = diff.removed,
            kept = diff.kept,
            "rule table replaced"
        );
        Ok(diff)
    }

    /// Patterns of a category in evaluation order.
    pub fn patterns(&self, category: &str) -> VigilResult<Vec<String>> {
        let table = self.table(category)?;
        let guard = table.lock()?;
        Ok(guard.rules.iter().map(|r| r.pattern.clone()).collect())
    }

    pub fn hit_count(&self, category: &str, pattern: &str) -> VigilResult<Option<u64>> {
        let table = self.table(category)?;
        let guard = table.lock()?;
        Ok(guard.rules.iter().find(|r| r.pattern == pattern).map(|r| r.hits))
    }

    /// Hits accumulated since the last report, per pattern (only non-zero entries).
    pub fn unreported(&self, category: &str) -> VigilResult<BTreeMap<String, u64>> {
        let table = self.table(category)?;
        let guard = table.lock()?;
        Ok(guard
            .rules
            .iter()
            .filter(|r| r.hits > r.reported)
            .map(|r| (r.pattern.clone(), r.hits - r.reported))
            .collect())
    }

    /// Advance the report watermark by the counts in `reported`. Hit counters are untouched.
    pub fn mark_reported(&self, category: &str, reported: &BTreeMap<String, u64>) -> VigilResult<()> {
        if reported.is_empty() {
            return Ok(());
        }
        let table = self.table(category)?;
        let mut guard = table.lock()?;
        for rule in guard.rules.iter_mut() {
            if let Some(delta) = reported.get(&rule.pattern) {
                rule.reported = (rule.reported + delta).min(rule.hits);
            }
        }
        self.persist(category, &guard)
    }

    /// Serialized table, as persisted.
    pub fn export(&self, category: &str) -> VigilResult<Vec<u8>> {
        let table = self.table(category)?;
        let guard = table.lock()?;
        Ok(serde_json::to_vec(&guard.records())?)
    }

    /// Replace a category's table from a serialized blob (rollback).
    pub fn restore(&self, category: &str, blob: &[u8]) -> VigilResult<usize> {
        let table = self.table(category)?;
        let stored: StoredTable = serde_json::from_slice(blob)?;
        let restored = RuleTable::from_records(category, stored.into_records());
        let mut guard = table.lock()?;
        *guard = restored;
        self.persist(category, &guard)?;
        Ok(guard.rules.len())
    }
}
