//! PCM formats, channel masks and stream types

use crate::{AfError, AfResult};
use serde::{Deserialize, Serialize};

/// Lowest sample rate accepted for a track.
pub const MIN_SAMPLE_RATE: u32 = 4_000;
/// Highest sample rate accepted for a track.
pub const MAX_SAMPLE_RATE: u32 = 192_000;

/// PCM sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Unsigned 8-bit. Only accepted from applications; expanded to 16-bit
    /// before it reaches shared memory.
    Pcm8,
    Pcm16,
    PcmFloat,
}

impl SampleFormat {
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Pcm8 => 1,
            Self::Pcm16 => 2,
            Self::PcmFloat => 4,
        }
    }

    /// Format as stored in the ring buffer.
    #[inline]
    pub fn shared_format(self) -> Self {
        match self {
            Self::Pcm8 => Self::Pcm16,
            other => other,
        }
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::Pcm16
    }
}

/// Output channel position bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMask(pub u32);

impl ChannelMask {
    pub const FRONT_LEFT: u32 = 0x1;
    pub const FRONT_RIGHT: u32 = 0x2;
    pub const FRONT_CENTER: u32 = 0x4;
    pub const LOW_FREQUENCY: u32 = 0x8;
    pub const BACK_LEFT: u32 = 0x10;
    pub const BACK_RIGHT: u32 = 0x20;

    const ALL: u32 = 0x3f;

    pub const MONO: Self = Self(Self::FRONT_LEFT);
    pub const STEREO: Self = Self(Self::FRONT_LEFT | Self::FRONT_RIGHT);
    pub const SURROUND_5_1: Self = Self(Self::ALL);

    #[inline]
    pub fn channel_count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0 && self.0 & !Self::ALL == 0
    }
}

impl Default for ChannelMask {
    fn default() -> Self {
        Self::STEREO
    }
}

/// Volume category of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    VoiceCall,
    System,
    Ring,
    Music,
    Alarm,
    Notification,
}

impl StreamType {
    pub const COUNT: usize = 6;

    pub const ALL: [StreamType; Self::COUNT] = [
        Self::VoiceCall,
        Self::System,
        Self::Ring,
        Self::Music,
        Self::Alarm,
        Self::Notification,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl Default for StreamType {
    fn default() -> Self {
        Self::Music
    }
}

/// Sample rate, encoding and channel layout of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmConfig {
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub channel_mask: ChannelMask,
}

impl PcmConfig {
    pub fn new(sample_rate: u32, format: SampleFormat, channel_mask: ChannelMask) -> Self {
        Self {
            sample_rate,
            format,
            channel_mask,
        }
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channel_mask.channel_count()
    }

    /// Bytes per frame as written by the application.
    #[inline]
    pub fn app_frame_size(&self) -> usize {
        self.channel_count() * self.format.bytes_per_sample()
    }

    /// Bytes per frame as seen by the consumer of the ring buffer.
    #[inline]
    pub fn shared_frame_size(&self) -> usize {
        self.channel_count() * self.format.shared_format().bytes_per_sample()
    }

    pub fn validate(&self) -> AfResult<()> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(AfError::invalid_argument(format!(
                "sample rate {} outside {}..={}",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        if !self.channel_mask.is_valid() {
            return Err(AfError::invalid_argument(format!(
                "channel mask {:#x}",
                self.channel_mask.0
            )));
        }
        Ok(())
    }
}

impl Default for PcmConfig {
    fn default() -> Self {
        Self::new(48_000, SampleFormat::Pcm16, ChannelMask::STEREO)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SAMPLE CONVERSION
// ═══════════════════════════════════════════════════════════════════════════════

/// Expand unsigned 8-bit samples to signed 16-bit. `dst` must hold
/// `src.len()` samples.
pub fn expand_u8_to_i16(src: &[u8], dst: &mut [i16]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = ((s as i16) - 0x80) << 8;
    }
}

#[inline]
pub fn i16_to_f32(s: i16) -> f32 {
    s as f32 / 32768.0
}

#[inline]
pub fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * 32767.0).round() as i16
}
