//! af-core: Shared types for the AudioFlow streaming engine
//!
//! Error taxonomy, PCM formats, frame/time math, gain packing and
//! configuration used by the shared-memory, server and client crates.

mod config;
mod error;
mod format;
mod time;
mod volume;
mod wakeup;

pub use config::*;
pub use error::*;
pub use format::*;
pub use time::*;
pub use volume::*;
pub use wakeup::*;

/// Identifier of a server-side track. Unique for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TrackId(pub u32);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

/// Identifier of an output route (one playback thread each).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct OutputId(pub u32);

impl std::fmt::Display for OutputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "output#{}", self.0)
    }
}

/// Audio session, used to group tracks sharing an effect chain.
pub type SessionId = u32;

/// Session id meaning "allocate a new one".
pub const SESSION_ALLOCATE: SessionId = 0;
