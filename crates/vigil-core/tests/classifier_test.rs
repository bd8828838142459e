//! Integration test: rule counting and the tiered ban-worthy policy.

mod common;

use common::{patterns, RecordingTransport, BOT_ID};
use std::collections::BTreeSet;
use std::sync::Arc;
use vigil_core::{
    AgentContext, Classifier, EmojiConfig, EmojiPolicy, EntityStore, MemoryBackend, RuleStore, TextKind, Trigger,
};

fn fixture() -> Arc<AgentContext> {
    let transport = RecordingTransport::new();
    let ctx = common::context(&transport);
    let rules = &ctx.rules;
    rules.replace_patterns("ada", &patterns(&["promo", "sale"])).unwrap();
    rules.replace_patterns("adb", &patterns(&["discount"])).unwrap();
    rules.replace_patterns("con", &patterns(&[r"wechat\s*\d+"])).unwrap();
    rules.replace_patterns("ban", &patterns(&["casino"])).unwrap();
    rules.replace_patterns("nm", &patterns(&["official support"])).unwrap();
    rules.replace_patterns("bio", &patterns(&["dm me"])).unwrap();
    ctx
}

#[test]
fn same_text_twice_counts_twice() {
    let ctx = fixture();
    assert!(ctx.classifier.classify(TextKind::BanWorthy, "best casino", false));
    assert!(ctx.classifier.classify(TextKind::BanWorthy, "best casino", false));
    assert_eq!(ctx.rules.hit_count("ban", "casino").unwrap(), Some(2));
}

#[test]
fn trusted_identities_short_circuit_before_rules() {
    let ctx = fixture();

    let verdict = ctx.classifier.assess(Some(BOT_ID), TextKind::BanWorthy, "casino casino", false);
    assert!(verdict.trusted);
    assert!(!verdict.spam);
    assert_eq!(ctx.rules.hit_count("ban", "casino").unwrap(), Some(0));

    // Trusted through a group roster; recorded scores are ignored.
    ctx.entities.set_trusted(-100, BTreeSet::from([42])).unwrap();
    ctx.entities.set_score(42, "NOSPAM", 5.0).unwrap();
    assert!(!ctx.classifier.classify_identity(42, TextKind::NameSpam, "official support casino", false));
    assert_eq!(ctx.entities.score_of(42, false), 0.0);
    assert_eq!(ctx.entities.score_of(42, true), 0.0);
    assert_eq!(ctx.rules.hit_count("nm", "official support").unwrap(), Some(0));
}

#[test]
fn ad_hit_with_contact_is_ban_worthy() {
    let ctx = fixture();
    ctx.rules.replace_patterns("ad", &patterns(&["cheap followers"])).unwrap();
    let c = &ctx.classifier;

    let verdict = c.assess(None, TextKind::BanWorthy, "cheap followers, wechat 888", false);
    assert!(verdict.spam);
    match verdict.trigger {
        Some(Trigger::AdWithContact { ad, contact }) => {
            assert_eq!(ad.pattern, "cheap followers");
            assert_eq!(contact.category, "con");
        }
        other => panic!("unexpected trigger: {:?}", other),
    }

    // An "ad" hit on its own is only one signal.
    assert!(!c.classify(TextKind::BanWorthy, "cheap followers", false));
    assert_eq!(ctx.rules.hit_count("ad", "cheap followers").unwrap(), Some(2));
}

#[test]
fn ad_letter_with_advertisement_emoji_is_ban_worthy() {
    let backend = Arc::new(MemoryBackend::new());
    let rules = Arc::new(RuleStore::open(backend.clone(), vigil_core::rules::default_categories()));
    rules.replace_patterns("adc", &patterns(&["crypto signals"])).unwrap();
    let entities = Arc::new(EntityStore::open(backend, Vec::<i64>::new(), 3.0));
    let emoji = EmojiPolicy::from_config(&EmojiConfig {
        set: vec!["🚀".to_string()],
        ad_single: 3,
        ..EmojiConfig::default()
    });
    let c = Classifier::new(rules, entities, emoji);

    let verdict = c.assess(None, TextKind::BanWorthy, "crypto signals 🚀🚀🚀", false);
    assert_eq!(verdict.trigger, Some(Trigger::AdLetterWithEmoji { letter: 'c' }));
    assert_eq!(verdict.trigger.unwrap().tag(), "adc+emoji");

    // Below the emoji threshold the ad letter stands alone.
    assert!(!c.classify(TextKind::BanWorthy, "crypto signals 🚀", false));
}

#[test]
fn ad_letter_needs_a_second_signal() {
    let ctx = fixture();
    let c = &ctx.classifier;

    let verdict = c.assess(None, TextKind::BanWorthy, "promo here, wechat 12345", false);
    assert!(verdict.spam);
    assert!(matches!(verdict.trigger, Some(Trigger::AdLetterWithContact { letter: 'a', .. })));

    assert!(!c.classify(TextKind::BanWorthy, "promo here", false));
}

#[test]
fn two_distinct_ad_letters_are_ban_worthy() {
    let ctx = fixture();
    let c = &ctx.classifier;

    let verdict = c.assess(None, TextKind::BanWorthy, "promo and discount", false);
    assert_eq!(verdict.trigger, Some(Trigger::TwoAdLetters { first: 'a', second: 'b' }));

    // Both patterns belong to "ada": still one letter.
    assert!(!c.classify(TextKind::BanWorthy, "promo sale", false));
    assert_eq!(c.detect_advertisement("promo sale", false, Some('a')), None);
}

#[test]
fn name_and_bio_scrutiny() {
    let ctx = fixture();
    let c = &ctx.classifier;

    assert!(c.classify(TextKind::NameSpam, "Official  Support", false));
    // Names are also held to bio rules; bios are not held to name rules.
    assert!(c.classify(TextKind::NameSpam, "dm me", false));
    assert!(c.classify(TextKind::BioSpam, "dm me", false));
    assert!(!c.classify(TextKind::BioSpam, "official support", false));
    // Both are held to ban rules.
    assert!(c.classify(TextKind::BioSpam, "casino", false));
}

#[test]
fn whitespace_is_collapsed_then_stripped() {
    let backend = Arc::new(MemoryBackend::new());
    let rules = RuleStore::open(backend, vec!["ad".to_string()]);
    rules.replace_patterns("ad", &patterns(&["free money"])).unwrap();

    assert!(rules.match_and_count("ad", "free   money", false).unwrap().is_some());
    assert!(rules.match_and_count("ad", "freemoney", false).unwrap().is_none());
    assert_eq!(rules.hit_count("ad", "free money").unwrap(), Some(1));

    rules.replace_patterns("ad", &patterns(&["freemoney"])).unwrap();
    let hit = rules.match_and_count("ad", "free money", false).unwrap().unwrap();
    assert_eq!(hit.matched, "freemoney");
    assert_eq!(hit.hits, 1);
}

#[test]
fn ocr_mode_skips_exempt_rules() {
    let backend = Arc::new(MemoryBackend::new());
    let rules = RuleStore::open(backend, vec!["con".to_string()]);
    rules
        .replace_patterns("con", &patterns(&["tg(?# nocr)", "telegram"]))
        .unwrap();

    assert!(rules.match_and_count("con", "my tg", true).unwrap().is_none());
    assert!(rules.match_and_count("con", "my tg", false).unwrap().is_some());
    assert!(rules.match_and_count("con", "telegram", true).unwrap().is_some());
}

#[test]
fn emoji_with_contact_is_ban_worthy() {
    let backend = Arc::new(MemoryBackend::new());
    let rules = Arc::new(RuleStore::open(backend.clone(), vigil_core::rules::default_categories()));
    rules.replace_patterns("con", &patterns(&["@\\w+"])).unwrap();
    let entities = Arc::new(EntityStore::open(backend, Vec::<i64>::new(), 3.0));
    let emoji = EmojiPolicy::from_config(&EmojiConfig {
        set: vec!["💰".to_string()],
        ad_single: 3,
        ..EmojiConfig::default()
    });
    let c = Classifier::new(rules, entities, emoji);

    let verdict = c.assess(None, TextKind::BanWorthy, "💰💰💰 @seller", false);
    assert!(matches!(verdict.trigger, Some(Trigger::EmojiWithContact { .. })));
    assert!(!c.classify(TextKind::BanWorthy, "💰💰💰", false));
    assert!(!c.classify(TextKind::BanWorthy, "💰 @seller", false));
}

#[test]
fn unknown_categories_are_rejected() {
    let rules = RuleStore::open(Arc::new(MemoryBackend::new()), vec!["ad".to_string()]);
    assert!(matches!(
        rules.match_and_count("zz", "text", false),
        Err(vigil_core::VigilError::UnknownCategory(_))
    ));
}
