//! Wire format between sensor nodes and the gateway.
//!
//! A node streams readings over TCP as three back-to-back fixed-size fields in
//! host byte order, with no length prefix or delimiter:
//!
//! | field       | type  | bytes |
//! |-------------|-------|-------|
//! | sensor id   | `u16` | 2     |
//! | value       | `f64` | 8     |
//! | timestamp   | `i64` | 8     |
//!
//! ```rust
//! use protocol::{FrameDecoder, Reading};
//!
//! let reading = Reading::new(7, 21.5, 1_700_000_000);
//! let frame = reading.encode();
//!
//! let mut decoder = FrameDecoder::new();
//! let mut decoded = Vec::new();
//! decoder.decode(&frame[..5], |r| decoded.push(r));
//! assert!(decoded.is_empty());
//! decoder.decode(&frame[5..], |r| decoded.push(r));
//! assert_eq!(decoded, vec![reading]);
//! ```

use std::io::{self, Write};

pub type SensorId = u16;
pub type SensorValue = f64;
/// Seconds since the unix epoch.
pub type Timestamp = i64;

const ID_LEN: usize = std::mem::size_of::<SensorId>();
const VALUE_LEN: usize = std::mem::size_of::<SensorValue>();
const TS_LEN: usize = std::mem::size_of::<Timestamp>();

/// Size of one encoded reading on the wire.
pub const FRAME_LEN: usize = ID_LEN + VALUE_LEN + TS_LEN;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub sensor_id: SensorId,
    pub value: SensorValue,
    pub timestamp: Timestamp,
}

impl Reading {
    pub fn new(sensor_id: SensorId, value: SensorValue, timestamp: Timestamp) -> Self {
        Reading {
            sensor_id,
            value,
            timestamp,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[..ID_LEN].copy_from_slice(&self.sensor_id.to_ne_bytes());
        frame[ID_LEN..ID_LEN + VALUE_LEN].copy_from_slice(&self.value.to_ne_bytes());
        frame[ID_LEN + VALUE_LEN..].copy_from_slice(&self.timestamp.to_ne_bytes());
        frame
    }

    pub fn decode(frame: &[u8; FRAME_LEN]) -> Self {
        let mut id = [0u8; ID_LEN];
        let mut value = [0u8; VALUE_LEN];
        let mut ts = [0u8; TS_LEN];
        id.copy_from_slice(&frame[..ID_LEN]);
        value.copy_from_slice(&frame[ID_LEN..ID_LEN + VALUE_LEN]);
        ts.copy_from_slice(&frame[ID_LEN + VALUE_LEN..]);
        Reading {
            sensor_id: SensorId::from_ne_bytes(id),
            value: SensorValue::from_ne_bytes(value),
            timestamp: Timestamp::from_ne_bytes(ts),
        }
    }

    /// Writes the reading as one frame. Used by sensor nodes.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode())
    }
}

/// Reassembles frames from a byte stream that may split them at any point.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    partial: [u8; FRAME_LEN],
    filled: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds received bytes and calls `emit` once per completed frame, in order.
    /// Returns the number of frames emitted.
    pub fn decode<F>(&mut self, mut data: &[u8], mut emit: F) -> usize
    where
        F: FnMut(Reading),
    {
        let mut emitted = 0;
        while !data.is_empty() {
            let take = (FRAME_LEN - self.filled).min(data.len());
            self.partial[self.filled..self.filled + take].copy_from_slice(&data[..take]);
            self.filled += take;
            data = &data[take..];

            if self.filled == FRAME_LEN {
                emit(Reading::decode(&self.partial));
                self.filled = 0;
                emitted += 1;
            }
        }
        emitted
    }

    /// Bytes of an incomplete frame currently held back.
    pub fn pending(&self) -> usize {
        self.filled
    }

    /// Drops an incomplete frame, e.g. when the peer went away mid-frame.
    pub fn reset(&mut self) -> usize {
        std::mem::replace(&mut self.filled, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn collect(decoder: &mut FrameDecoder, data: &[u8]) -> Vec<Reading> {
        let mut out = Vec::new();
        decoder.decode(data, |r| out.push(r));
        out
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(FRAME_LEN, 18);
    }

    #[test]
    fn test_field_layout() {
        let frame = Reading::new(0x0102, 99.9, 1_700_000_000).encode();

        assert_eq!(&frame[..2], &0x0102u16.to_ne_bytes());
        assert_eq!(&frame[2..10], &99.9f64.to_ne_bytes());
        assert_eq!(&frame[10..], &1_700_000_000i64.to_ne_bytes());
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(7)]
    #[case(17)]
    fn test_split_frame(#[case] split: usize) {
        let reading = Reading::new(7, 99.9, 1_650_000_000);
        let frame = reading.encode();
        let mut decoder = FrameDecoder::new();

        assert!(collect(&mut decoder, &frame[..split]).is_empty());
        assert_eq!(decoder.pending(), split);
        assert_eq!(collect(&mut decoder, &frame[split..]), vec![reading]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_many_frames_in_one_chunk_keep_order() {
        let readings: Vec<_> = (0..5)
            .map(|i| Reading::new(i, i as f64 * 1.5, 1_700_000_000 + i as i64))
            .collect();
        let mut bytes: Vec<u8> = readings.iter().flat_map(|r| r.encode()).collect();
        bytes.extend_from_slice(&readings[0].encode()[..4]);

        let mut decoder = FrameDecoder::new();
        let decoded = collect(&mut decoder, &bytes);

        assert_eq!(decoded, readings);
        assert_eq!(decoder.pending(), 4);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let frame = Reading::new(3, 1.0, 2).encode();
        let mut decoder = FrameDecoder::new();

        collect(&mut decoder, &frame[..10]);
        assert_eq!(decoder.reset(), 10);
        assert_eq!(decoder.pending(), 0);

        let next = Reading::new(4, 2.0, 3);
        assert_eq!(collect(&mut decoder, &next.encode()), vec![next]);
    }

    #[test]
    fn test_write_to() {
        let reading = Reading::new(12, -3.25, 1_700_000_123);
        let mut out = Vec::new();
        reading.write_to(&mut out).unwrap();

        assert_eq!(out.len(), FRAME_LEN);
        assert_eq!(Reading::decode(out.as_slice().try_into().unwrap()), reading);
    }
}
