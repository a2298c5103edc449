//! Control-block flag word

bitflags::bitflags! {
    /// Independently settable bits shared by client and server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CblkFlags: u32 {
        /// Consumer found the ring empty; playback waits for a refill.
        const UNDERRUN = 1 << 0;
        /// Server side is gone or the track was invalidated.
        const INVALID = 1 << 1;
        /// A static loop wrapped back to its start.
        const LOOP_CYCLE = 1 << 2;
        /// The last requested loop pass finished.
        const LOOP_FINAL = 1 << 3;
        /// Static playback reached the end of the buffer.
        const BUFFER_END = 1 << 4;
        /// Server dropped the track after too many empty cycles.
        const DISABLED = 1 << 5;
        /// Skip the initial fill requirement.
        const FORCE_READY = 1 << 6;
        /// Wake a blocked obtain with `Interrupted`.
        const INTERRUPT = 1 << 7;
        /// All frames up to the stream end were presented.
        const STREAM_END_DONE = 1 << 8;
        /// Capture producer found the ring full.
        const OVERRUN = 1 << 9;
    }
}

impl CblkFlags {
    /// Static-playback events the client callback loop consumes and clears.
    /// UNDERRUN is not among them: it gates the server until the refill.
    pub const CLIENT_EVENTS: Self = Self::LOOP_CYCLE
        .union(Self::LOOP_FINAL)
        .union(Self::BUFFER_END);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_distinct() {
        let all = CblkFlags::all();
        assert_eq!(all.bits().count_ones(), 10);
        assert!(CblkFlags::CLIENT_EVENTS.contains(CblkFlags::LOOP_FINAL));
        assert!(!CblkFlags::CLIENT_EVENTS.contains(CblkFlags::INVALID));
        assert!(!CblkFlags::CLIENT_EVENTS.contains(CblkFlags::UNDERRUN));
    }
}
