//! af-server: Tracks, mixing and playback threads
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────┐
//! │ AudioServer  │────▶│ PlaybackThread │────▶│  OutputSink  │
//! │              │     │                │     │              │
//! │ - outputs    │     │ - tracks       │     │ - write      │
//! │ - create RPC │     │ - mixer        │     │ - latency    │
//! │ - PeerLost   │     │ - fast path    │     │ - drain      │
//! └──────────────┘     └────────────────┘     └──────────────┘
//!         │                    ▲
//!         ▼                    │ ServerProxy
//! ┌──────────────┐     ┌────────────────┐
//! │ TrackHandle  │     │  SharedRegion  │◀──── client
//! └──────────────┘     └────────────────┘
//! ```
//!
//! Control calls go through [`TrackHandle`] to the owning thread's lock.
//! Audio goes through the shared region only.

mod fast_path;
mod mixer;
mod output_track;
mod server;
mod sink;
mod thread;
mod thread_priority;
mod track;

pub use fast_path::*;
pub use mixer::*;
pub use output_track::*;
pub use server::*;
pub use sink::*;
pub use thread::*;
pub use thread_priority::*;
pub use track::*;
