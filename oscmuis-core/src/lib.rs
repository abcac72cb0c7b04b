//! Core library for the OSC-Muis trigger device.
//! This crate owns the dual-role (AP + station) network state machine,
//! resolves broadcast targets from the current topology and dispatches
//! OSC trigger messages over UDP. The radio itself is abstracted behind
//! the `WifiRadio` trait so different backends can be plugged in.

pub mod backends;
pub mod config;
pub mod network;
pub mod osc;
pub mod portal;
pub mod scheduler;
pub mod settings;
pub mod structs;
pub mod traits;
pub mod web_server;

// Define a shared Error and Result type for the entire crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Radio error: {0}")]
    Radio(String),

    #[error("Settings store error: {0}")]
    Settings(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Web server error: {0}")]
    WebServer(#[from] axum::BoxError),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Port {0} is outside 1-65535")]
    InvalidPort(i64),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;
