//! Consumer side of a desktop media bus video stream.
//!
//! A [`Stream`] connects to a bus node through a shared, thread-confined
//! [`bus::BusConnection`], negotiates a pixel format and memory-layout
//! modifier with the producer, and turns every delivered buffer into a
//! [`capture::Frame`] for its [`StreamHandler`].
//!
//! ```rust,ignore
//! use pwsource::bus::pipewire::PipeWireBus;
//! use pwsource::negotiation::NoDmaBuf;
//!
//! let stream = pwsource::Stream::new(MyHandler::default());
//! stream.start(&PipeWireBus::new(), &NoDmaBuf, node_id, Some(portal_fd.as_fd()))?;
//! let conn = stream.connection().expect("started");
//! while conn.has_listeners() {
//!     pwsource::bus::driver::pump(&conn, std::time::Duration::from_millis(100))?;
//! }
//! ```

pub mod bus;
pub mod capture;
pub mod error;
pub mod negotiation;
pub mod stream;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use error::{BusError, Error, Result};
pub use stream::{ImportFailed, Stream, StreamHandler, StreamState};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub frame: FrameConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Streams are named `<prefix>-<node id>` unless given a name.
    pub name_prefix: String,
    /// Offer DMA-BUF transport at all.
    pub allow_dmabuf: bool,
    /// Request damage metadata for new streams.
    pub with_damage: bool,
    pub min_buffers: u32,
    pub max_buffers: u32,
    pub default_buffers: u32,
    pub align: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Edge of the square shown for unreadable buffers.
    pub error_marker_size: u32,
    pub cursor_size: u32,
    pub cursor_max_size: u32,
    pub max_damage_regions: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name_prefix: "pwsource".into(),
            allow_dmabuf: true,
            with_damage: false,
            min_buffers: 2,
            max_buffers: 16,
            default_buffers: 16,
            align: 16,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            error_marker_size: 200,
            cursor_size: 64,
            cursor_max_size: 1024,
            max_damage_regions: 16,
        }
    }
}

impl Config {
    /// Load defaults, then `path` (TOML) if given, then `PWSOURCE__*`
    /// environment overrides such as `PWSOURCE__STREAM__ALLOW_DMABUF=false`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("PWSOURCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Replace the process-wide configuration. Streams built afterwards pick
    /// it up; running ones keep their snapshot.
    pub fn install(self) {
        CONFIG.store(std::sync::Arc::new(self));
    }
}
