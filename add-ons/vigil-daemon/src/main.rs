//! Vigil agent daemon.
//!
//! Reads one JSON object per line from stdin:
//! - `{"packet": {"token": "...", "attachment": {"name": "...", "bytes": "<base64>"}}}`
//! - `{"join": {"group_id": .., "message_id": .., "date": .., "members": [..]}}`
//! - `{"check": {"kind": "name" | "bio" | "ban", "text": "...", "user_id": ..}}`
//!
//! Outbound envelopes are written to stdout by the stdio transport; logs go to stderr.

mod stdio;

use serde::Deserialize;
use std::{path::PathBuf, sync::Arc};
use stdio::{StdioTransport, WirePacket};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::{
    spawn_maintenance, AgentContext, JoinEvent, JoinOrchestrator, PassThrough, SignalBus, SledBackend, TextKind,
    VigilConfig, VigilResult,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Input {
    Packet(WirePacket),
    Join(JoinEvent),
    Check(CheckRequest),
}

#[derive(Debug, Deserialize)]
struct CheckRequest {
    kind: String,
    text: String,
    #[serde(default)]
    user_id: Option<i64>,
}

fn text_kind(raw: &str) -> Option<TextKind> {
    match raw {
        "name" => Some(TextKind::NameSpam),
        "bio" => Some(TextKind::BioSpam),
        "ban" => Some(TextKind::BanWorthy),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[vigil-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "vigil daemon stopped");
        std::process::exit(1);
    }
}

async fn run() -> VigilResult<()> {
    let config = VigilConfig::load()?;
    let backend = Arc::new(SledBackend::open_path(&config.state_path())?);
    let media_dir = std::env::var("VIGIL_MEDIA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(&config.data_dir).join("media"));
    let transport = Arc::new(StdioTransport::new(media_dir));

    let ctx = AgentContext::build(config, backend, transport, Arc::new(PassThrough))?;
    let bus = SignalBus::new(Arc::clone(&ctx));
    let orchestrator = Arc::new(JoinOrchestrator::new(Arc::clone(&bus)));
    let maintenance = spawn_maintenance(Arc::clone(&bus));

    tracing::info!(
        agent = %ctx.config.agent_name,
        version = %ctx.config.version,
        data_dir = %ctx.config.data_dir,
        "vigil daemon started"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => dispatch(&line, &bus, &orchestrator),
                    Ok(None) => {
                        tracing::info!("stdin closed; shutting down daemon");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed; shutting down daemon");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down daemon");
                break;
            }
        }
    }

    maintenance.abort();
    Ok(())
}

/// Each input runs on its own task so a slow join batch never blocks bus traffic.
fn dispatch(line: &str, bus: &Arc<SignalBus>, orchestrator: &Arc<JoinOrchestrator>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let input: Input = match serde_json::from_str(line) {
        Ok(input) => input,
        Err(e) => {
            tracing::warn!(error = %e, "unreadable input line");
            return;
        }
    };

    match input {
        Input::Packet(wire) => {
            let packet = match wire.into_packet() {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!(error = %e, "attachment is not base64");
                    return;
                }
            };
            let bus = Arc::clone(bus);
            tokio::spawn(async move {
                let outcome = bus.handle(packet).await;
                tracing::debug!(?outcome, "packet handled");
            });
        }
        Input::Join(event) => {
            let orchestrator = Arc::clone(orchestrator);
            tokio::spawn(async move {
                let report = orchestrator.handle_join(&event).await;
                tracing::info!(
                    group_id = event.group_id,
                    processed = report.outcomes.len(),
                    halted = report.halted,
                    ignored = report.ignored,
                    "join handled"
                );
            });
        }
        Input::Check(req) => {
            let Some(kind) = text_kind(&req.kind) else {
                tracing::warn!(kind = %req.kind, "unknown check kind");
                return;
            };
            let ctx = bus.context();
            let text = ctx.normalizer.normalize(&req.text, true, false, false);
            let verdict = ctx.classifier.assess(req.user_id, kind, &text, false);
            tracing::info!(
                ?kind,
                spam = verdict.spam,
                trusted = verdict.trusted,
                trigger = %verdict.trigger.as_ref().map(|t| t.tag()).unwrap_or_default(),
                "check"
            );
        }
    }
}
