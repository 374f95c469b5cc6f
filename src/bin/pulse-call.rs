//! Kommandozeilen-Client
//!
//! ```text
//! pulse-call call   [config.json]   Ruft im konfigurierten Raum an
//! pulse-call answer [config.json]   Wartet auf den nächsten Anruf und nimmt ihn an
//! ```
//!
//! Ohne Pfad wird die Datei am Standard-Pfad gelesen, falls vorhanden,
//! sonst die `PULSE_*` Umgebungsvariablen.

use anyhow::{bail, Context, Result};
use pulse_call::call_engine::{CallEvent, CallState, DeviceAudio, OpusCodec, WebRtcTransportFactory};
use pulse_call::config::ClientConfig;
use pulse_call::VoiceClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn load_config(path: Option<String>) -> Result<ClientConfig> {
    if let Some(path) = path {
        return ClientConfig::from_json_file(&PathBuf::from(&path))
            .with_context(|| format!("failed to load config from {}", path));
    }

    let default_path = ClientConfig::default_path()?;
    if default_path.exists() {
        tracing::info!("Using config file {}", default_path.display());
        return ClientConfig::from_json_file(&default_path)
            .with_context(|| format!("failed to load config from {}", default_path.display()));
    }

    ClientConfig::from_env().context("no config file found and PULSE_* environment incomplete")
}

async fn wait_for_incoming(events: &mut broadcast::Receiver<CallEvent>) -> Result<String> {
    loop {
        match events.recv().await {
            Ok(CallEvent::IncomingCall { call_id }) => return Ok(call_id),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => bail!("client stopped"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    pulse_call::init_tracing();

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "answer".to_string());
    let config = load_config(args.next())?;

    let client = VoiceClient::connect(
        config.clone(),
        Arc::new(OpusCodec),
        Arc::new(WebRtcTransportFactory),
    )
    .await?;
    let mut events = client.subscribe();

    match mode.as_str() {
        "call" => {
            let call_id = client.start_call().await?;
            tracing::info!("Calling ({})", call_id);
        }
        "answer" => {
            tracing::info!("Waiting for incoming call...");
            let call_id = tokio::select! {
                call_id = wait_for_incoming(&mut events) => call_id?,
                _ = tokio::signal::ctrl_c() => {
                    client.shutdown().await;
                    return Ok(());
                }
            };
            tracing::info!("Answering {}", call_id);
            client.accept_call().await?;
        }
        other => bail!("unknown mode '{}', expected 'call' or 'answer'", other),
    }

    let mut device = DeviceAudio::new(&config.call)?;
    device.start_capture()?;
    device.start_playback()?;

    let mut capture_tick = tokio::time::interval(Duration::from_millis(10));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, hanging up");
                break;
            }
            _ = capture_tick.tick() => {
                while let Some(frame) = device.read_frame() {
                    if client.call_state() == CallState::Connected {
                        if let Err(e) = client.enqueue_outgoing_audio(&frame.to_le_bytes()) {
                            tracing::debug!("Outgoing audio rejected: {}", e);
                        }
                    }
                }
            }
            frame = client.dequeue_incoming_frame(), if client.call_state() == CallState::Connected => {
                if let Some(frame) = frame {
                    device.write_frame(&frame);
                }
            }
            event = events.recv() => {
                match event {
                    Ok(CallEvent::StateChanged(CallState::Ended)) => {
                        tracing::info!("Call ended");
                        break;
                    }
                    Ok(CallEvent::Error(e)) => tracing::error!("Call error: {}", e),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    device.stop();
    client.shutdown().await;
    Ok(())
}
