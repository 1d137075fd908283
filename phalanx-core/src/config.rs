//! Shared runtime configuration.
//!
//! This module introduces types to facilitate the configuration of the
//! runtime environment.
//!
//! # Features:
//! - [`Config`]: Represents the main configuration structure. It's adorned
//!   with [`clap`] attributes to allow easy setup via command-line arguments.
//! - [`Serializer`]: Specifies the serialization format to use.
//!
//! # Usage:
//! Both master and worker processes require these configurations since they
//! are the same executable. The [`Config`] struct is passed to
//! [`start_app`](crate::runtime::start_app), which dispatches on the process
//! role.

use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::heartbeat::HeartbeatConfig;

const HELP_HEADING: &str = "Phalanx options";

/// Represents the main configuration structure for the runtime.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Determines the serialization format to be used for all wire frames.
    ///
    /// Spawned workers inherit the spawner's choice through the reserved
    /// environment variable, so both ends of every stream frame alike.
    #[arg(long, help_heading = HELP_HEADING, value_enum, env = "PARALLEL_SERIALIZER", default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Interval between heartbeat ticks on a parent/child liveness link, in
    /// milliseconds.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 1_000)]
    pub heartbeat_interval_ms: u64,

    /// Silence window after which a heartbeat link is declared dead, in
    /// milliseconds.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 5_000)]
    pub heartbeat_timeout_ms: u64,

    /// How long to wait for a spawned worker's reverse handshake, in
    /// milliseconds.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 10_000)]
    pub spawn_timeout_ms: u64,

    /// Grace period for draining live connections when a server or
    /// connection closes, in milliseconds.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 5_000)]
    pub close_grace_ms: u64,

    /// Skip the binary identity check during the spawn handshake.
    ///
    /// Master and worker are expected to run byte-identical executables;
    /// only disable the check when that is deliberately not the case.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = false)]
    pub skip_binary_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serializer: Default::default(),
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 5_000,
            spawn_timeout_ms: 10_000,
            close_grace_ms: 5_000,
            skip_binary_check: false,
        }
    }
}

impl Config {
    /// The default heartbeat parameterization for links spawned under this
    /// configuration.
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig::from_millis(self.heartbeat_interval_ms, self.heartbeat_timeout_ms)
    }

    /// The reverse-handshake deadline for spawned workers.
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    /// The drain window honored by the shutdown cascade and connection
    /// close.
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    /// Matches the clap value names, so the value written into a child's
    /// environment parses back on the other side.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl std::str::FromStr for Serializer {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "postcard" => Ok(Self::Postcard),
            "cbor" => Ok(Self::Cbor),
            other => Err(format!("unknown serializer {other:?}")),
        }
    }
}
