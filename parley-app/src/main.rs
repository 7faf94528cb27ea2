//! Parley headless host entry point.
//!
//! Opens a live voice session against the websocket remote using the system
//! microphone and speakers. Status events are printed to stdout as JSON lines;
//! logs go to stderr. Ctrl-C closes the session cleanly.
//!
//! With `--offline` no audio hardware is touched: a silent microphone and a
//! software-clocked speaker stand in, which is enough to exercise the remote
//! handshake.

mod cli;
mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use cli::Cli;
use parley_core::{
    audio::device::{list_input_devices, list_output_devices},
    AudioBackend, CpalBackend, LiveSession, OfflineBackend, SessionState, WsConnector,
};
use settings::{default_settings_path, load_settings, save_settings};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const DEFAULT_LOG_FILTER: &str = "parley=info,parley_core=info";

/// Tick of the offline clock.
const OFFLINE_TICK: Duration = Duration::from_millis(20);

fn print_devices() -> anyhow::Result<()> {
    let devices = serde_json::json!({
        "input": list_input_devices(),
        "output": list_output_devices(),
    });
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

/// Drive an offline backend in real time: feed silence, advance the speaker.
fn spawn_offline_clock(backend: OfflineBackend, input_rate: u32) -> tokio::task::JoinHandle<()> {
    let silence = vec![0.0f32; (input_rate as u128 * OFFLINE_TICK.as_millis() / 1000) as usize];
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(OFFLINE_TICK);
        loop {
            tick.tick().await;
            backend.push_input(&silence);
            backend.output().advance_secs(OFFLINE_TICK.as_secs_f64());
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Cli::parse();
    if args.list_devices {
        return print_devices();
    }

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = args.settings.clone().unwrap_or_else(default_settings_path);
    let mut app_settings = load_settings(&settings_path);
    app_settings.apply_env_overrides();
    info!(
        settings_path = ?settings_path,
        model = %app_settings.model,
        voice = %app_settings.voice,
        offline = args.offline,
        "Parley starting"
    );
    if args.init_settings {
        save_settings(&settings_path, &app_settings)
            .with_context(|| format!("failed to write {}", settings_path.display()))?;
        info!(settings_path = ?settings_path, "settings written");
        return Ok(());
    }

    let context = args.read_context()?;
    let api_key = app_settings
        .api_key
        .clone()
        .context("no API key: set PARLEY_API_KEY or apiKey in the settings file")?;
    let connector = WsConnector::new(app_settings.endpoint.clone(), api_key);
    let config = app_settings.to_session_config();

    // ── Audio ─────────────────────────────────────────────────────────────
    let mut offline_clock = None;
    let backend: Arc<dyn AudioBackend> = if args.offline {
        let input_rate = config.input_format.sample_rate;
        let offline = OfflineBackend::new(input_rate, config.output_format.sample_rate);
        offline_clock = Some(spawn_offline_clock(offline.clone(), input_rate));
        Arc::new(offline)
    } else {
        Arc::new(CpalBackend::new(
            config.preferred_input_device.clone(),
            config.preferred_output_device.clone(),
        ))
    };

    // ── Session ───────────────────────────────────────────────────────────
    let session = LiveSession::new(config).on_close(|outcome| {
        info!(state = %outcome.state, detail = ?outcome.detail, "session ended");
    });
    session.set_muted(args.muted || app_settings.start_muted);

    let mut status = session.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "failed to encode status event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "status printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    session
        .start(&context, backend, &connector)
        .await
        .context("failed to start live session")?;

    let outcome = tokio::select! {
        outcome = session.wait_closed() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, closing session");
            session.close();
            session.wait_closed().await
        }
    };

    if let Some(clock) = offline_clock {
        clock.abort();
    }

    let snap = session.diagnostics_snapshot();
    info!(
        sent = snap.frames_sent,
        chunks = snap.chunks_received,
        interruptions = snap.interruptions,
        "Parley exiting"
    );

    if outcome.state == SessionState::Error {
        bail!(
            "session failed: {}",
            outcome.detail.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(())
}
