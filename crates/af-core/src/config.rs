//! Server and client tuning, loadable from JSON

use crate::{AfError, AfResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Playback-thread and track-lifecycle tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Default output sample rate
    pub sample_rate: u32,
    /// Frames per sink write (one mix cycle)
    pub mix_frame_count: usize,
    /// Idle time before an output enters standby
    pub standby_delay_ms: u64,
    /// Not-ready cycles tolerated before a mixed track is disabled
    pub max_track_retries: u32,
    /// Same, for a direct output
    pub max_track_retries_direct: u32,
    /// Same, for an offloaded output
    pub max_track_retries_offload: u32,
    /// Cycles a freshly started track may spend filling
    pub max_track_startup_retries: u32,
    pub min_thread_sleep_us: u64,
    pub max_thread_sleep_shift: u32,
    /// How long a control-plane caller waits for a config event to apply
    pub set_parameters_timeout_ms: u64,
    /// Minimum spacing between "write blocked" warnings
    pub write_blocked_warn_ms: u64,
    pub max_tracks_per_thread: usize,
    pub max_fast_tracks: usize,
    /// Length of the gain ramp applied when a track starts or resumes
    pub volume_ramp_frames: usize,
    /// Upper bound on a mixing-thread sleep while tracks are enabled
    pub poll_ceiling_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            mix_frame_count: 960,
            standby_delay_ms: 3_000,
            max_track_retries: 50,
            max_track_retries_direct: 2,
            max_track_retries_offload: 20,
            max_track_startup_retries: 50,
            min_thread_sleep_us: 5_000,
            max_thread_sleep_shift: 2,
            set_parameters_timeout_ms: 2_000,
            write_blocked_warn_ms: 5_000,
            max_tracks_per_thread: 32,
            max_fast_tracks: 8,
            volume_ramp_frames: 64,
            poll_ceiling_ms: 100,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> AfResult<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| AfError::invalid_argument(format!("server config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> AfResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AfError::invalid_argument(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> AfResult<()> {
        if self.mix_frame_count == 0 {
            return Err(AfError::invalid_argument("mix_frame_count must be > 0"));
        }
        if self.sample_rate == 0 {
            return Err(AfError::invalid_argument("sample_rate must be > 0"));
        }
        if self.max_tracks_per_thread == 0 {
            return Err(AfError::invalid_argument("max_tracks_per_thread must be > 0"));
        }
        Ok(())
    }

    #[inline]
    pub fn standby_delay(&self) -> Duration {
        Duration::from_millis(self.standby_delay_ms)
    }

    #[inline]
    pub fn min_thread_sleep(&self) -> Duration {
        Duration::from_micros(self.min_thread_sleep_us)
    }

    #[inline]
    pub fn set_parameters_timeout(&self) -> Duration {
        Duration::from_millis(self.set_parameters_timeout_ms)
    }

    #[inline]
    pub fn poll_ceiling(&self) -> Duration {
        Duration::from_millis(self.poll_ceiling_ms)
    }
}

/// Client handle tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Attempts to rebuild a dead server track before giving up
    pub max_recreate_tries: u32,
    /// Callback-thread pause after a callback supplied no data
    pub wait_period_ms: u64,
    /// Longest callback-thread sleep when no event is scheduled
    pub callback_poll_ceiling_ms: u64,
    /// Slack added to frame-derived callback wakeups
    pub wakeup_slack_ms: u64,
    pub stream_end_timeout_ms: u64,
    /// Capacity of the death-notification channel
    pub event_queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_recreate_tries: 5,
            wait_period_ms: 10,
            callback_poll_ceiling_ms: 1_000,
            wakeup_slack_ms: 10,
            stream_end_timeout_ms: 1_000,
            event_queue_depth: 16,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> AfResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| AfError::invalid_argument(format!("client config: {e}")))
    }

    #[inline]
    pub fn wait_period(&self) -> Duration {
        Duration::from_millis(self.wait_period_ms)
    }

    #[inline]
    pub fn callback_poll_ceiling(&self) -> Duration {
        Duration::from_millis(self.callback_poll_ceiling_ms)
    }

    #[inline]
    pub fn wakeup_slack(&self) -> Duration {
        Duration::from_millis(self.wakeup_slack_ms)
    }

    #[inline]
    pub fn stream_end_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_end_timeout_ms)
    }
}
