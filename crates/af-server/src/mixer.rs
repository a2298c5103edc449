//! Software mixer: per-track gain with click-free ramps, float accumulation

use af_core::{AfError, AfResult, PcmConfig, SampleFormat, TrackId, f32_to_i16, i16_to_f32};
use std::collections::HashMap;

/// Gain state of one mixed track
#[derive(Debug, Clone, Copy)]
struct TrackGain {
    current: [f32; 2],
    target: [f32; 2],
}

impl TrackGain {
    fn silent() -> Self {
        Self {
            current: [0.0; 2],
            target: [0.0; 2],
        }
    }
}

/// Accumulates PCM from any number of tracks into one float mix buffer and
/// renders it in the sink's format.
///
/// Mixing is order independent: every track is scaled by its own gain and
/// summed. Clipping happens once, at render time.
pub struct AudioMixer {
    channels: usize,
    frame_count: usize,
    ramp_frames: usize,
    mix: Vec<f32>,
    gains: HashMap<TrackId, TrackGain>,
}

impl AudioMixer {
    pub fn new(channels: usize, frame_count: usize, ramp_frames: usize) -> Self {
        Self {
            channels,
            frame_count,
            ramp_frames: ramp_frames.max(1),
            mix: vec![0.0; channels * frame_count],
            gains: HashMap::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Change the cycle length. Only called between cycles.
    pub fn resize(&mut self, frame_count: usize) {
        self.frame_count = frame_count;
        self.mix.resize(self.channels * frame_count, 0.0);
    }

    /// Zero the mix buffer for a new cycle.
    pub fn begin(&mut self) {
        self.mix.fill(0.0);
    }

    /// Set the gain a track should reach. Without `ramp` the gain jumps.
    pub fn set_volume(&mut self, id: TrackId, left: f32, right: f32, ramp: bool) {
        let gain = self.gains.entry(id).or_insert_with(TrackGain::silent);
        gain.target = [left, right];
        if !ramp {
            gain.current = gain.target;
        }
    }

    /// Restart a track's ramp from silence (start, resume).
    pub fn ramp_from_zero(&mut self, id: TrackId) {
        self.gains.entry(id).or_insert_with(TrackGain::silent).current = [0.0; 2];
    }

    pub fn current_volume(&self, id: TrackId) -> Option<(f32, f32)> {
        self.gains.get(&id).map(|g| (g.current[0], g.current[1]))
    }

    pub fn remove(&mut self, id: TrackId) {
        self.gains.remove(&id);
    }

    pub fn clear(&mut self) {
        self.gains.clear();
    }

    /// Add `src` (whole frames in the track's shared format) into the mix
    /// starting at frame `at`. Returns frames mixed.
    pub fn accumulate(&mut self, id: TrackId, src: &[u8], config: &PcmConfig, at: usize) -> usize {
        let format = config.format.shared_format();
        let in_channels = config.channel_count();
        let frame_size = config.shared_frame_size();
        let frames = (src.len() / frame_size).min(self.frame_count.saturating_sub(at));
        let step = 1.0 / self.ramp_frames as f32;
        let out_channels = self.channels;
        let gain = self.gains.entry(id).or_insert_with(TrackGain::silent);

        for f in 0..frames {
            for side in 0..2 {
                let delta = gain.target[side] - gain.current[side];
                gain.current[side] += delta.clamp(-step, step);
            }
            let frame = &src[f * frame_size..(f + 1) * frame_size];
            let out = &mut self.mix[(at + f) * out_channels..(at + f + 1) * out_channels];
            for (c, slot) in out.iter_mut().enumerate() {
                let sample = if in_channels == 1 {
                    read_sample(frame, format, 0)
                } else if c < in_channels {
                    read_sample(frame, format, c)
                } else {
                    continue;
                };
                *slot += sample * gain.current[c.min(1)];
            }
        }
        frames
    }

    pub fn mix_buffer(&self) -> &[f32] {
        &self.mix
    }

    /// Convert the mix buffer to `format`, replacing the contents of `out`.
    pub fn render(&self, format: SampleFormat, out: &mut Vec<u8>) -> AfResult<()> {
        out.clear();
        match format {
            SampleFormat::Pcm16 => {
                for &s in &self.mix {
                    out.extend_from_slice(&f32_to_i16(s).to_ne_bytes());
                }
            }
            SampleFormat::PcmFloat => {
                for &s in &self.mix {
                    out.extend_from_slice(&s.clamp(-1.0, 1.0).to_ne_bytes());
                }
            }
            SampleFormat::Pcm8 => {
                return Err(AfError::invalid_argument("8-bit output is not supported"));
            }
        }
        Ok(())
    }
}

#[inline]
fn read_sample(frame: &[u8], format: SampleFormat, channel: usize) -> f32 {
    match format {
        SampleFormat::PcmFloat => {
            let at = channel * 4;
            f32::from_ne_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]])
        }
        _ => {
            let at = channel * 2;
            i16_to_f32(i16::from_ne_bytes([frame[at], frame[at + 1]]))
        }
    }
}

/// Scale interleaved PCM in place by a left/right gain pair. Used by the
/// direct output, which copies a single track without mixing.
pub fn apply_gain_in_place(bytes: &mut [u8], format: SampleFormat, channels: usize, left: f32, right: f32) {
    if left == 1.0 && right == 1.0 {
        return;
    }
    let width = format.shared_format().bytes_per_sample();
    for (i, sample) in bytes.chunks_exact_mut(width).enumerate() {
        let gain = if channels > 1 && i % channels == 1 { right } else { left };
        match format.shared_format() {
            SampleFormat::PcmFloat => {
                let v = f32::from_ne_bytes([sample[0], sample[1], sample[2], sample[3]]) * gain;
                sample.copy_from_slice(&v.to_ne_bytes());
            }
            _ => {
                let v = i16_to_f32(i16::from_ne_bytes([sample[0], sample[1]])) * gain;
                sample.copy_from_slice(&f32_to_i16(v).to_ne_bytes());
            }
        }
    }
}
