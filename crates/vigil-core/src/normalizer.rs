//! Text normalizer: canonicalizes names, bios and message text before rule matching.
//!
//! Steps, in order:
//! 1. special-character substitution (`spc` table, then `spe` table), per character;
//! 2. NFKC compatibility normalization;
//! 3. script folding through a [`ScriptConverter`] when the locale is simplified Chinese;
//! 4. optional printable filter (newline, carriage return and tab survive);
//! 5. optional charset restriction (ASCII alphanumerics, CJK ideographs, fixed punctuation).
//!
//! Steps 1–3 run only when normalization is enabled and the caller asks for folding.
//! Normalization never fails: collaborator errors degrade to pass-through.

use crate::error::VigilResult;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use unicode_general_category::{get_general_category, GeneralCategory};
use unicode_normalization::UnicodeNormalization;

/// Everything outside this set is removed under charset restriction.
static RESTRICT_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[^\da-zA-Z\x{4E00}-\x{9FA5}.,:'"?!~;()。，？！～@“”]"#)
        .expect("charset pattern is valid")
});

/// Which substitution table a rule set feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialTable {
    /// Special characters (look-alike letters and digits).
    Character,
    /// Special emoji (enclosed and decorated glyphs).
    Emoji,
}

impl SpecialTable {
    /// Rule category whose patterns define this table.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Character => "spc",
            Self::Emoji => "spe",
        }
    }

    pub fn from_category(category: &str) -> Option<Self> {
        match category {
            "spc" => Some(Self::Character),
            "spe" => Some(Self::Emoji),
            _ => None,
        }
    }
}

/// External script conversion collaborator (e.g. traditional → simplified).
pub trait ScriptConverter: Send + Sync {
    fn convert(&self, text: &str) -> VigilResult<String>;
}

/// Converter that returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl ScriptConverter for PassThrough {
    fn convert(&self, text: &str) -> VigilResult<String> {
        Ok(text.to_string())
    }
}

#[derive(Debug, Default)]
struct SpecialTables {
    character: HashMap<char, char>,
    emoji: HashMap<char, char>,
}

/// Parse one substitution rule of the form `[KEYS](?# v)`.
///
/// Every character of `KEYS` maps to `v`. Rules without a bracket group or a
/// comment value are ignored.
pub fn parse_special_rule(rule: &str) -> Option<(Vec<char>, char)> {
    if !rule.contains('[') {
        return None;
    }
    let (head, _) = rule.split_once(']')?;
    let keys: Vec<char> = head.chars().skip(1).collect();
    let (_, tail) = rule.split_once("?#")?;
    let value = tail.chars().nth(1)?;
    if keys.is_empty() {
        return None;
    }
    Some((keys, value))
}

/// Shared, reconfigurable text normalizer.
pub struct TextNormalizer {
    enabled: bool,
    fold_script: bool,
    converter: Arc<dyn ScriptConverter>,
    tables: RwLock<SpecialTables>,
}

impl TextNormalizer {
    /// `enabled` is the master normalization switch; `fold_script` enables the converter.
    pub fn new(enabled: bool, fold_script: bool, converter: Arc<dyn ScriptConverter>) -> Self {
        Self {
            enabled,
            fold_script,
            converter,
            tables: RwLock::new(SpecialTables::default()),
        }
    }

    /// Normalizer with substitution and NFKC enabled and a pass-through converter.
    pub fn plain() -> Self {
        Self::new(true, false, Arc::new(PassThrough))
    }

    /// Replace one substitution table from its rule patterns. Returns the number of mapped characters.
    pub fn rebuild_table(&self, table: SpecialTable, rules: &[String]) -> usize {
        let mut map = HashMap::new();
        for rule in rules {
            if let Some((keys, value)) = parse_special_rule(rule) {
                for k in keys {
                    map.insert(k, value);
                }
            }
        }
        let mapped = map.len();
        match self.tables.write() {
            Ok(mut tables) => match table {
                SpecialTable::Character => tables.character = map,
                SpecialTable::Emoji => tables.emoji = map,
            },
            Err(e) => {
                tracing::warn!(target: "vigil::normalizer", error = %e, "substitution table lock poisoned");
                return 0;
            }
        }
        tracing::debug!(target: "vigil::normalizer", table = table.category(), mapped, "substitution table rebuilt");
        mapped
    }

    /// Canonicalize `text`.
    ///
    /// An empty result means "no usable text", not an error.
    pub fn normalize(
        &self,
        text: &str,
        apply_script_fold: bool,
        strip_non_printable: bool,
        restrict_charset: bool,
    ) -> String {
        if text.is_empty() {
            return String::new();
        }

        let mut result = text.to_string();

        if self.enabled && apply_script_fold {
            result = self.substitute(&result);
            result = result.nfkc().collect();

            if self.fold_script {
                match self.converter.convert(&result) {
                    Ok(converted) => result = converted,
                    Err(e) => {
                        tracing::warn!(target: "vigil::normalizer", error = %e, "script conversion failed; passing through");
                    }
                }
            }
        }

        if strip_non_printable {
            result = result
                .chars()
                .filter(|&c| is_printable(c) || matches!(c, '\n' | '\r' | '\t'))
                .collect();
        }

        if restrict_charset {
            result = RESTRICT_CHARSET.replace_all(&result, "").into_owned();
        }

        result
    }

    fn substitute(&self, text: &str) -> String {
        let tables = match self.tables.read() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(target: "vigil::normalizer", error = %e, "substitution skipped");
                return text.to_string();
            }
        };
        let first: String = text
            .chars()
            .map(|c| tables.character.get(&c).copied().unwrap_or(c))
            .collect();
        first
            .chars()
            .map(|c| tables.emoji.get(&c).copied().unwrap_or(c))
            .collect()
    }
}

/// Printability in the sense of "renders as visible text": ASCII space is printable;
/// other separators, controls, format, surrogate, private-use and unassigned code
/// points are not.
pub fn is_printable(c: char) -> bool {
    use GeneralCategory::*;
    c == ' '
        || !matches!(
            get_general_category(c),
            Control
                | Format
                | Surrogate
                | PrivateUse
                | Unassigned
                | SpaceSeparator
                | LineSeparator
                | ParagraphSeparator
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VigilError;

    struct Broken;

    impl ScriptConverter for Broken {
        fn convert(&self, _text: &str) -> VigilResult<String> {
            Err(VigilError::Config("no conversion table".to_string()))
        }
    }

    #[test]
    fn substitution_runs_before_nfkc() {
        let n = TextNormalizer::plain();
        n.rebuild_table(SpecialTable::Character, &["[4Ꭺ](?# a)".to_string()]);
        assert_eq!(n.normalize("Ꭺd", true, false, false), "ad");
        // NFKC folds fullwidth letters on its own.
        assert_eq!(n.normalize("ｆｒｅｅ", true, false, false), "free");
    }

    #[test]
    fn tables_apply_in_priority_order() {
        let n = TextNormalizer::plain();
        n.rebuild_table(SpecialTable::Character, &["[x](?# y)".to_string()]);
        n.rebuild_table(SpecialTable::Emoji, &["[y](?# z)".to_string()]);
        assert_eq!(n.normalize("x", true, false, false), "z");
    }

    #[test]
    fn folding_is_skipped_when_not_requested() {
        let n = TextNormalizer::plain();
        assert_eq!(n.normalize("ｆｒｅｅ", false, false, false), "ｆｒｅｅ");
    }

    #[test]
    fn failing_converter_degrades_to_pass_through() {
        let n = TextNormalizer::new(true, true, Arc::new(Broken));
        assert_eq!(n.normalize("hello", true, false, false), "hello");
    }

    #[test]
    fn printable_filter_keeps_line_breaks_and_tabs() {
        let n = TextNormalizer::plain();
        let out = n.normalize("a\u{200B}b\n\tc\u{0007}", false, true, false);
        assert_eq!(out, "ab\n\tc");
    }

    #[test]
    fn format_and_unassigned_code_points_are_not_printable() {
        for c in ['\u{110BD}', '\u{1D173}', '\u{1D17A}', '\u{0378}', '\u{E000}', '\u{00A0}', '\u{2028}'] {
            assert!(!is_printable(c), "U+{:04X}", c as u32);
        }
        for c in [' ', 'a', '加', '★', '\u{0301}', '💰'] {
            assert!(is_printable(c), "U+{:04X}", c as u32);
        }
    }

    #[test]
    fn charset_restriction_is_strictest() {
        let n = TextNormalizer::plain();
        assert_eq!(n.normalize("加 V: abc_123 ★", false, false, true), "加V:abc123");
    }

    #[test]
    fn special_rule_parsing() {
        assert_eq!(parse_special_rule("[ÀÁ](?# a)"), Some((vec!['À', 'Á'], 'a')));
        assert_eq!(parse_special_rule("plain"), None);
        assert_eq!(parse_special_rule("[]"), None);
    }
}
