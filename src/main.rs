//! Application entry point: voice-stream.
//!
//! # Startup sequence
//!
//! 1. Initialise logging (`RUST_LOG`, default `info`).
//! 2. Load [`AppConfig`] from disk (defaults on first run) and validate it.
//! 3. Build a current-thread tokio runtime; everything below runs on it.
//! 4. Create the event queue and the [`Coordinator`].
//! 5. Spawn the status printer (one JSON line per status on stdout).
//! 6. Start the hotkey thread and forward its toggles into the queue.
//! 7. Hand the VAD monitor to the coordinator (no device until armed).
//! 8. Post `Shutdown` on Ctrl-C.
//! 9. Connect and run the coordinator until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use voice_stream::{
    audio::{
        capture::validate_config, AudioSource, CaptureConstraints, CpalSource, VadMonitor,
        VoiceActivity,
    },
    config::AppConfig,
    hotkey::{HotkeyBindings, HotkeyEvent, HotkeyListener},
    stream::{event_channel, new_shared_state, Coordinator, Event, EventSender, Status},
    transport::WsConnector,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load().context("failed to load settings")?;
    validate_config(&config.capture).context("invalid [capture] settings")?;
    log::info!(
        "voice-stream: endpoint {}, VAD {}",
        config.connection.url,
        if config.vad.enabled { "armed" } else { "disarmed" }
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: AppConfig) -> Result<()> {
    let (events, events_rx) = event_channel();
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let source: Arc<dyn AudioSource> = Arc::new(CpalSource::new());

    let mut coordinator = Coordinator::new(
        &config,
        Arc::new(WsConnector::new()),
        Arc::clone(&source),
        events.clone(),
        new_shared_state(),
    )
    .with_status_channel(status_tx);

    tokio::spawn(print_statuses(status_rx));

    // Hotkeys are optional: a bad binding or a platform without global key
    // capture leaves the client driven by VAD alone.
    let _hotkeys = match HotkeyBindings::from_config(&config.hotkey) {
        Ok(bindings) => {
            let (hotkey_tx, hotkey_rx) = mpsc::channel(16);
            let listener = HotkeyListener::start(bindings, hotkey_tx)?;
            tokio::spawn(forward_hotkeys(hotkey_rx, events.clone()));
            Some(listener)
        }
        Err(e) => {
            log::warn!("hotkey: disabled: {e:#}");
            None
        }
    };

    // The monitor exists even when VAD starts disarmed so the VAD hotkey can
    // arm it later; it opens its input only while armed.
    let vad = VadMonitor::new(
        Arc::clone(&source),
        CaptureConstraints::from(&config.capture),
        config.vad.clone(),
        events.clone(),
    )
    .map(|monitor| Box::new(monitor) as Box<dyn VoiceActivity>);
    let _ = events.send(Event::VadReady(vad));

    {
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("voice-stream: cannot listen for Ctrl-C: {e}");
                return;
            }
            let _ = events.send(Event::Shutdown);
        });
    }

    coordinator.connect();
    let stats = coordinator.run(events_rx).await;

    log::info!(
        "voice-stream: exiting ({} chunks / {} bytes sent, {} dropped, {} connection attempts)",
        stats.chunks_sent,
        stats.bytes_sent,
        stats.chunks_dropped,
        stats.attempts
    );
    Ok(())
}

async fn print_statuses(mut statuses: mpsc::UnboundedReceiver<Status>) {
    while let Some(status) = statuses.recv().await {
        match serde_json::to_string(&status) {
            Ok(line) => println!("{line}"),
            Err(e) => log::warn!("voice-stream: cannot serialise status: {e}"),
        }
    }
}

async fn forward_hotkeys(mut hotkeys: mpsc::Receiver<HotkeyEvent>, events: EventSender) {
    while let Some(hotkey) = hotkeys.recv().await {
        if events.send(Event::from(hotkey)).is_err() {
            break;
        }
    }
}
