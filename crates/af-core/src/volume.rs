//! Linear gain helpers and the U4.12 packed form used in shared memory

use crate::{AfError, AfResult};

/// Unity gain in U4.12.
pub const UNITY_GAIN_U4_12: u16 = 0x1000;

/// Encode a linear gain into U4.12, saturating at 16x.
#[inline]
pub fn gain_to_u4_12(gain: f32) -> u16 {
    let scaled = (gain.max(0.0) * UNITY_GAIN_U4_12 as f32).round();
    scaled.min(u16::MAX as f32) as u16
}

#[inline]
pub fn u4_12_to_gain(v: u16) -> f32 {
    v as f32 / UNITY_GAIN_U4_12 as f32
}

/// Pack a left/right gain pair: left in the low half, right in the high half.
#[inline]
pub fn pack_volume_lr(left: f32, right: f32) -> u32 {
    gain_to_u4_12(left) as u32 | ((gain_to_u4_12(right) as u32) << 16)
}

#[inline]
pub fn unpack_volume_lr(packed: u32) -> (f32, f32) {
    (
        u4_12_to_gain(packed as u16),
        u4_12_to_gain((packed >> 16) as u16),
    )
}

/// Application-facing gains must lie in `[0, 1]`.
pub fn check_unit_gain(name: &str, gain: f32) -> AfResult<()> {
    if !(0.0..=1.0).contains(&gain) {
        return Err(AfError::invalid_argument(format!("{name} {gain} outside [0, 1]")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pack_unpack() {
        let packed = pack_volume_lr(1.0, 0.5);
        assert_eq!(packed & 0xffff, 0x1000);
        assert_eq!(packed >> 16, 0x0800);
        let (l, r) = unpack_volume_lr(packed);
        assert_relative_eq!(l, 1.0);
        assert_relative_eq!(r, 0.5);
    }

    #[test]
    fn test_saturation() {
        assert_eq!(gain_to_u4_12(-1.0), 0);
        assert_eq!(gain_to_u4_12(100.0), u16::MAX);
    }

    #[test]
    fn test_check_unit_gain() {
        assert!(check_unit_gain("volume", 0.0).is_ok());
        assert!(check_unit_gain("volume", 1.0).is_ok());
        assert!(check_unit_gain("volume", 1.01).is_err());
        assert!(check_unit_gain("volume", f32::NAN).is_err());
    }
}
