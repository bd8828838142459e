//! Integration test: inbound envelope dispatch and outbound replies.

mod common;

use common::{packet, packet_with_file, patterns, RecordingTransport};
use serde_json::json;
use std::collections::BTreeMap;
use vigil_core::{BadKind, ClearScope, Dispatch, Packet, Route, SignalBus};

#[tokio::test]
async fn envelope_for_other_agents_changes_nothing() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));
    let before = bus.context().entities.snapshot().unwrap();

    let p = packet("NOSPAM", &["WARN", "LANG"], "add", "bad", json!({"id": 7, "type": "user"}));
    assert_eq!(bus.handle(p).await, Dispatch::NotAddressed);

    assert_eq!(bus.context().entities.snapshot().unwrap(), before);
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn replayed_add_bad_is_a_no_op() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));

    let p = packet("NOSPAM", &["AVATAR"], "add", "bad", json!({"id": 7, "type": "user"}));
    assert_eq!(bus.handle(p.clone()).await, Dispatch::Applied(Route::AddBad));
    let once = bus.context().entities.snapshot().unwrap();
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::AddBad));

    let twice = bus.context().entities.snapshot().unwrap();
    assert_eq!(once, twice);
    assert_eq!(twice.bad.users.iter().filter(|&&id| id == 7).count(), 1);
    assert!(bus.context().entities.is_class_d_user(7));
}

#[tokio::test]
async fn undecodable_and_unrouted_traffic_is_dropped() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));

    assert_eq!(bus.handle(Packet::new("garbage")).await, Dispatch::Undecodable);

    let foreign = vigil_core::BusCipher::new(&[9u8; 32]).unwrap();
    let token = vigil_core::Envelope::new("MANAGE", vec!["AVATAR".into()], "add", "bad", json!({"id": 1, "type": "user"}))
        .seal(&foreign, chrono::Utc::now())
        .unwrap();
    assert_eq!(bus.handle(Packet::new(token)).await, Dispatch::Undecodable);

    let p = packet("CAPTCHA", &["AVATAR"], "add", "bad", json!({"id": 1, "type": "user"}));
    assert_eq!(bus.handle(p).await, Dispatch::Unrouted);
    assert!(bus.context().entities.snapshot().unwrap().bad.users.is_empty());
}

#[tokio::test]
async fn malformed_payloads_fail_without_side_effects() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));

    let p = packet("MANAGE", &["AVATAR"], "add", "bad", json!({"id": "seven"}));
    assert_eq!(bus.handle(p).await, Dispatch::Failed(Route::AddBad));
    let p = packet("MANAGE", &["AVATAR"], "add", "bad", json!({"id": 7, "type": "planet"}));
    assert_eq!(bus.handle(p).await, Dispatch::Failed(Route::AddBad));
    assert!(bus.context().entities.snapshot().unwrap().bad.users.is_empty());
}

#[tokio::test]
async fn exemption_and_clearing() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));
    let entities = &bus.context().entities;

    bus.handle(packet("MANAGE", &["AVATAR"], "add", "bad", json!({"id": 5, "type": "user"}))).await;
    bus.handle(packet("MANAGE", &["AVATAR"], "add", "except", json!({"id": 5, "type": "long"}))).await;
    assert!(!entities.is_class_d_user(5));

    bus.handle(packet("MANAGE", &["AVATAR"], "remove", "except", json!({"id": 5, "type": "long"}))).await;
    assert!(entities.is_class_d_user(5));

    let p = packet("MANAGE", &["AVATAR"], "clear", "bad", json!({"admin_id": 1, "type": "users"}));
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::Clear(ClearScope::Bad)));
    assert!(!entities.is_class_d_user(5));

    bus.handle(packet("USER", &["AVATAR"], "remove", "bad", json!({"id": 5, "type": "user"}))).await;
    assert!(!entities.is_class_d_user(5));
    entities.add_bad(BadKind::Channel, -1001).unwrap();
    assert!(entities.is_bad_channel(-1001));
}

#[tokio::test]
async fn declare_score_and_watch_updates() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));
    let entities = &bus.context().entities;

    let p = packet("CAPTCHA", &["AVATAR"], "update", "declare", json!({"group_id": -100, "message_id": 3}));
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::Declare));
    assert!(entities.is_declared(-100, 3));

    bus.handle(packet("NOSPAM", &["AVATAR"], "update", "score", json!({"id": 8, "score": 2.0}))).await;
    bus.handle(packet("LANG", &["AVATAR"], "update", "score", json!({"id": 8, "score": 1.5}))).await;
    assert_eq!(entities.score_of(8, false), 3.5);
    assert_eq!(entities.score_of(8, true), 3.5);
    assert_eq!(entities.identity(8).unwrap().score.get("nospam"), Some(&2.0));

    let p = packet("WATCH", &["AVATAR"], "add", "watch", json!({"id": 8, "type": "ban", "until": 2_000}));
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::AddWatch));
    assert!(entities.is_watched(8, "ban", 1_999));
    assert!(!entities.is_watched(8, "ban", 2_000));
    assert!(!entities.is_watched(8, "delete", 1_000));
}

#[tokio::test]
async fn version_ask_is_answered_to_the_sender() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));

    let p = packet("HIDE", &["AVATAR"], "version", "ask", json!({"admin_id": 11, "message_id": 22}));
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::VersionAsk));

    let sent = transport.sent_envelopes();
    assert_eq!(sent.len(), 1);
    let (reply, attachment) = &sent[0];
    assert_eq!(reply.from, "AVATAR");
    assert_eq!(reply.to, vec!["HIDE".to_string()]);
    assert_eq!((reply.action.as_str(), reply.action_type.as_str()), ("version", "reply"));
    assert_eq!(reply.data["message_id"], 22);
    assert_eq!(reply.data["version"], bus.context().config.version);
    assert!(attachment.is_none());
}

#[tokio::test]
async fn regex_update_replaces_rules_and_substitution_tables() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));
    let ctx = bus.context().clone();

    ctx.rules.replace_patterns("ad", &patterns(&["old", "kept"])).unwrap();
    ctx.rules.match_and_count("ad", "kept", false).unwrap();

    let list = serde_json::to_vec(&json!(["kept", "new"])).unwrap();
    let p = packet_with_file("REGEX", &["AVATAR"], "regex", "update", json!("ad_words"), "ad_words", &list);
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::RegexUpdate));
    assert_eq!(ctx.rules.patterns("ad").unwrap(), patterns(&["kept", "new"]));
    assert_eq!(ctx.rules.hit_count("ad", "kept").unwrap(), Some(1));

    assert_eq!(ctx.normalizer.normalize("Ꭺd", true, false, false), "Ꭺd");
    let table = serde_json::to_vec(&json!({"[Ꭺ](?# a)": 0})).unwrap();
    let p = packet_with_file("REGEX", &["AVATAR"], "regex", "update", json!("spc_words"), "spc_words", &table);
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::RegexUpdate));
    assert_eq!(ctx.normalizer.normalize("Ꭺd", true, false, false), "ad");

    // Unsealed or missing files are refused.
    let p = packet("REGEX", &["AVATAR"], "regex", "update", json!("ad_words"));
    assert_eq!(bus.handle(p).await, Dispatch::Failed(Route::RegexUpdate));
}

#[tokio::test]
async fn uploaded_count_tables_keep_their_order() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));
    let ctx = bus.context().clone();

    let table = br#"{"zeta": 0, "alpha": 0}"#;
    let p = packet_with_file("REGEX", &["AVATAR"], "regex", "update", json!("ad_words"), "ad_words", table);
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::RegexUpdate));
    assert_eq!(ctx.rules.patterns("ad").unwrap(), patterns(&["zeta", "alpha"]));

    let hit = ctx.rules.match_and_count("ad", "zeta alpha", false).unwrap().unwrap();
    assert_eq!(hit.pattern, "zeta");
    assert_eq!(ctx.rules.hit_count("ad", "alpha").unwrap(), Some(0));

    let p = packet_with_file(
        "MANAGE",
        &["AVATAR"],
        "backup",
        "rollback",
        json!({"admin_id": 1, "type": "rules/ad"}),
        "rules/ad",
        br#"{"omega": 5, "beta": 1}"#,
    );
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::Rollback));
    assert_eq!(ctx.rules.patterns("ad").unwrap(), patterns(&["omega", "beta"]));
    assert_eq!(ctx.rules.hit_count("ad", "omega").unwrap(), Some(5));
}

#[tokio::test]
async fn count_request_reports_only_new_hits() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));
    let ctx = bus.context().clone();
    ctx.rules.replace_patterns("con", &patterns(&["wechat"])).unwrap();
    ctx.rules.match_and_count("con", "wechat", false).unwrap();
    ctx.rules.match_and_count("con", "wechat", false).unwrap();

    let ask = || packet("REGEX", &["AVATAR"], "regex", "count", json!("ask"));
    assert_eq!(bus.handle(ask()).await, Dispatch::Applied(Route::RegexCountAsk));

    let sent = transport.sent_envelopes();
    assert_eq!(sent.len(), 1);
    let (report, attachment) = &sent[0];
    assert_eq!(report.to, vec!["REGEX".to_string()]);
    assert_eq!(report.data, json!("con_words"));
    let plain = common::cipher().open_bytes(&attachment.as_ref().unwrap().bytes).unwrap();
    let counts: BTreeMap<String, u64> = serde_json::from_slice(&plain).unwrap();
    assert_eq!(counts.get("wechat"), Some(&2));

    // Counters stay monotonic; nothing new means nothing sent.
    assert_eq!(ctx.rules.hit_count("con", "wechat").unwrap(), Some(2));
    bus.handle(ask()).await;
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn rollback_restores_a_backed_up_section() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));
    let entities = &bus.context().entities;

    entities.add_white(77).unwrap();
    let blob = entities.export("white_ids").unwrap();
    entities.remove_white(77).unwrap();
    entities.add_white(78).unwrap();

    let p = packet_with_file(
        "MANAGE",
        &["AVATAR"],
        "backup",
        "rollback",
        json!({"admin_id": 1, "type": "white_ids"}),
        "white_ids",
        &blob,
    );
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::Rollback));
    assert!(entities.is_white_user(77));
    assert!(!entities.is_white_user(78));

    let bad = packet_with_file("MANAGE", &["AVATAR"], "backup", "rollback", json!({"type": "white_ids"}), "x", b"{oops");
    assert_eq!(bus.handle(bad).await, Dispatch::Failed(Route::Rollback));
    assert!(entities.is_white_user(77));
}

#[tokio::test]
async fn backup_now_sends_every_blob_sealed() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));
    bus.context().entities.add_white(3).unwrap();

    let sent = vigil_core::backup_all(&bus).await;
    let envelopes = transport.sent_envelopes();
    assert_eq!(envelopes.len(), sent);
    assert_eq!(sent, 7 + bus.context().rules.categories().len());

    let (white, attachment) = envelopes
        .iter()
        .find(|(e, _)| e.data == json!("white_ids"))
        .unwrap();
    assert_eq!(white.to, vec!["BACKUP".to_string()]);
    assert_eq!((white.action.as_str(), white.action_type.as_str()), ("backup", "data"));
    let plain = common::cipher().open_bytes(&attachment.as_ref().unwrap().bytes).unwrap();
    assert_eq!(plain, b"[3]");
}

#[tokio::test]
async fn refresh_pulls_rosters_for_known_groups() {
    let transport = RecordingTransport::new();
    let bus = SignalBus::new(common::context(&transport));
    let entities = &bus.context().entities;
    entities.set_admins(-100, [1].into()).unwrap();

    transport.rosters.lock().unwrap().insert(
        -100,
        vigil_core::GroupRoster {
            admins: [1, 2].into(),
            trusted: [50].into(),
        },
    );
    let p = packet("MANAGE", &["AVATAR"], "update", "refresh", json!(1));
    assert_eq!(bus.handle(p).await, Dispatch::Applied(Route::Refresh));
    assert!(entities.is_admin(-100, 2));
    assert!(entities.is_class_e_user(50));
}
