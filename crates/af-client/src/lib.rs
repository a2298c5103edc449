//! af-client: Application-side audio tracks
//!
//! An [`AudioTrack`] owns one server-side track at a time and hides its
//! replacement from the application:
//!
//! ```text
//! ┌────────────┐  write / obtain   ┌──────────────┐   ring    ┌────────────────┐
//! │ AudioTrack │ ────────────────► │ ClientProxy  │ ◄───────► │ PlaybackThread │
//! └─────┬──────┘                   └──────────────┘           └────────────────┘
//!       │ DeadObject / PeerLost
//!       ▼
//!  restore_track: new TrackHandle, same position, same volume
//! ```
//!
//! Transfer modes decide who moves the data: the caller (`Sync`, `Obtain`),
//! a callback thread (`Callback`), or nobody after creation (`Shared`).

mod callback;
mod death;
mod restore;
mod track;

pub use callback::*;
pub use track::*;
