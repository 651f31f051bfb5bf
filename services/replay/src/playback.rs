//! Boundary with the external playback engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Seek capability of the active source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekMode {
    /// Seekable timeline (VOD, recorded files)
    Absolute,
    /// Live source with a seekable buffer behind the live edge
    LiveBuffered,
    /// No seeking possible
    Disabled,
}

impl std::fmt::Display for SeekMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SeekMode::Absolute => "absolute",
            SeekMode::LiveBuffered => "live_buffered",
            SeekMode::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// Command sent to the playback engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekCommand {
    /// Seek to an absolute timeline position and pause.
    SeekAndPause { position: Duration },
    /// Seek back from the live edge by `offset` and pause.
    SeekBackAndPause { offset: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeekError {
    #[error("Position {0:?} outside the seekable range")]
    OutOfRange(Duration),

    #[error("Playback engine rejected seek: {0}")]
    Rejected(String),

    #[error("Frame has no playback position")]
    NoPosition,
}

/// The playback engine as seen from the buffer.
#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    fn seek_mode(&self) -> SeekMode;

    async fn seek_and_pause(&self, command: SeekCommand) -> Result<(), SeekError>;
}

/// Engine stand-in that accepts every seek and logs it.
#[derive(Debug, Clone)]
pub struct LoggingPlaybackEngine {
    mode: SeekMode,
}

impl LoggingPlaybackEngine {
    pub fn new(mode: SeekMode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl PlaybackEngine for LoggingPlaybackEngine {
    fn seek_mode(&self) -> SeekMode {
        self.mode
    }

    async fn seek_and_pause(&self, command: SeekCommand) -> Result<(), SeekError> {
        match command {
            SeekCommand::SeekAndPause { position } => {
                info!(position_ms = position.as_millis() as u64, "Seek and pause")
            }
            SeekCommand::SeekBackAndPause { offset } => {
                info!(offset_ms = offset.as_millis() as u64, "Seek back from live edge and pause")
            }
        }
        Ok(())
    }
}
