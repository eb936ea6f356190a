//! Beast frame counting.
//!
//! Every Beast frame starts with the escape byte 0x1A followed by a type
//! byte. A literal 0x1A inside a payload is doubled (0x1A 0x1A), so the
//! pair must be skipped rather than counted.
//!
//! The counter is stateless. A frame whose escape byte is the last byte of
//! one read and whose type byte is the first byte of the next is not
//! counted. Counters are statistics, not protocol state, so the relay
//! accepts that undercount instead of carrying reassembly state between
//! reads.

/// Frame start / escape byte.
pub const BEAST_ESCAPE: u8 = 0x1A;

/// Mode-A/C reply (2 byte payload).
pub const TYPE_MODE_AC: u8 = 0x31;
/// Mode-S short frame (7 byte payload).
pub const TYPE_MODE_S_SHORT: u8 = 0x32;
/// Mode-S long frame (14 byte payload), includes DF17 extended squitter.
pub const TYPE_MODE_S_LONG: u8 = 0x33;
/// Receiver status frame.
pub const TYPE_STATUS: u8 = 0x34;
/// Mode-S long frame with extended metadata.
pub const TYPE_MODE_S_LONG_EXT: u8 = 0x35;

/// Counts produced by a single scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCount {
    /// Recognised frames of any type.
    pub messages: u64,
    /// Frames of a long type, which are the ones able to carry positions.
    pub positions: u64,
}

impl FrameCount {
    pub fn is_empty(&self) -> bool {
        self.messages == 0 && self.positions == 0
    }
}

/// Is this a type byte that introduces a frame?
pub fn is_frame_type(b: u8) -> bool {
    matches!(
        b,
        TYPE_MODE_AC | TYPE_MODE_S_SHORT | TYPE_MODE_S_LONG | TYPE_STATUS | TYPE_MODE_S_LONG_EXT
    )
}

/// Is this a long Mode-S type byte (position-capable)?
pub fn is_long_type(b: u8) -> bool {
    matches!(b, TYPE_MODE_S_LONG | TYPE_MODE_S_LONG_EXT)
}

/// Count Beast frames and position-capable frames in `data`.
pub fn count_frames(data: &[u8]) -> FrameCount {
    let mut count = FrameCount::default();
    let mut i = 0;

    // The escape lookahead needs one more byte, so stop one short of the end.
    while i + 1 < data.len() {
        if data[i] == BEAST_ESCAPE {
            let next = data[i + 1];
            if next == BEAST_ESCAPE {
                i += 2;
                continue;
            }
            if is_frame_type(next) {
                count.messages += 1;
                if is_long_type(next) {
                    count.positions += 1;
                }
                i += 2;
                continue;
            }
        }
        i += 1;
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one frame: escape, type, 6 timestamp bytes, signal, payload.
    fn frame(type_byte: u8, payload_len: usize) -> Vec<u8> {
        let mut f = vec![BEAST_ESCAPE, type_byte];
        f.extend_from_slice(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);
        f.push(0x80);
        f.extend(std::iter::repeat(0x5D).take(payload_len));
        f
    }

    #[test]
    fn short_frames_have_no_positions() {
        let mut buf = Vec::new();
        for _ in 0..5 {
            buf.extend(frame(TYPE_MODE_S_SHORT, 7));
        }
        assert_eq!(
            count_frames(&buf),
            FrameCount { messages: 5, positions: 0 }
        );
    }

    #[test]
    fn long_frames_count_as_positions() {
        let mut buf = Vec::new();
        for _ in 0..4 {
            buf.extend(frame(TYPE_MODE_S_LONG, 14));
        }
        assert_eq!(
            count_frames(&buf),
            FrameCount { messages: 4, positions: 4 }
        );
    }

    #[test]
    fn mixed_types() {
        let mut buf = frame(TYPE_MODE_AC, 2);
        buf.extend(frame(TYPE_MODE_S_LONG_EXT, 14));
        buf.extend(frame(TYPE_STATUS, 14));
        buf.extend(frame(TYPE_MODE_S_SHORT, 7));
        assert_eq!(
            count_frames(&buf),
            FrameCount { messages: 4, positions: 1 }
        );
    }

    #[test]
    fn escaped_pair_is_not_a_frame() {
        assert!(count_frames(&[BEAST_ESCAPE, BEAST_ESCAPE]).is_empty());
    }

    #[test]
    fn escaped_pair_followed_by_type_byte_is_payload() {
        // 1a 1a 33: the pair is a literal, the 0x33 that follows is plain data.
        assert!(count_frames(&[BEAST_ESCAPE, BEAST_ESCAPE, TYPE_MODE_S_LONG]).is_empty());
    }

    #[test]
    fn escape_inside_payload_does_not_hide_next_frame() {
        let mut buf = vec![BEAST_ESCAPE, TYPE_MODE_S_SHORT, 0x01, BEAST_ESCAPE, BEAST_ESCAPE, 0x02];
        buf.extend(frame(TYPE_MODE_S_LONG, 14));
        assert_eq!(
            count_frames(&buf),
            FrameCount { messages: 2, positions: 1 }
        );
    }

    #[test]
    fn unknown_type_byte_is_ignored() {
        assert!(count_frames(&[BEAST_ESCAPE, 0x40, 0x00]).is_empty());
    }

    #[test]
    fn trailing_escape_is_not_read_past_end() {
        assert!(count_frames(&[0x00, 0x01, BEAST_ESCAPE]).is_empty());
        assert!(count_frames(&[BEAST_ESCAPE]).is_empty());
        assert!(count_frames(&[]).is_empty());
    }

    #[test]
    fn frame_split_across_reads_is_undercounted() {
        let f = frame(TYPE_MODE_S_LONG, 14);
        let (head, tail) = f.split_at(1);
        let total = count_frames(head).messages + count_frames(tail).messages;
        assert_eq!(total, 0);
    }

    #[test]
    fn rescanning_gives_the_same_answer() {
        let mut buf = frame(TYPE_MODE_S_SHORT, 7);
        buf.extend(frame(TYPE_MODE_S_LONG, 14));
        let first = count_frames(&buf);
        let second = count_frames(&buf);
        assert_eq!(first, second);
        assert_eq!(first, FrameCount { messages: 2, positions: 1 });
    }
}
