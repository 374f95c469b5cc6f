//! Signaling Module - Matrix Client für Call-Control Nachrichten
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Homeserver:
//! - Login und Access Token
//! - `m.call.*` Events senden
//! - Eingehende Events per `/sync` empfangen und weiterleiten
//!

mod client;
mod messages;

pub use client::{SignalingChannel, SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
