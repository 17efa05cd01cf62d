//! Wire format of the inter-worker channel.
//!
//! Forward direction (sender to receiver), after a 16-byte handshake of
//! `u64 BE operator_id || u64 BE subplan_id`:
//!
//! ```text
//! u32 BE length || u64 BE origin || u64 BE seq || u64 BE watermark
//!               || u32 BE tuple_count || payload
//! ```
//!
//! where `length` counts everything after itself. A frame whose length is
//! exactly one byte is the end-of-stream marker: its single body byte is the
//! termination kind.
//!
//! Reverse direction (receiver to sender), after a one-byte handshake ack:
//! event frames of `u8 kind || payload`. `StartSourceEvent` has an empty
//! payload; `PropagateEpochEvent` carries `u64 BE query_id || u64 BE
//! epoch_ts`.
//!
//! Malformed frames are rejected with `ProtocolViolation`; the codecs never
//! panic on wire input.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use rill_core::error::EngineError;
use rill_core::reconfig::TerminationKind;

/// Metadata header bytes of a data frame after the length prefix.
const DATA_HEADER: usize = 8 + 8 + 8 + 4;

/// Upper bound on a frame body; anything larger is a corrupt length.
const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub origin: u64,
    pub seq: u64,
    pub watermark: u64,
    pub tuple_count: u32,
    pub payload: Bytes,
}

/// What flows sender -> receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Data(DataFrame),
    EndOfStream(TerminationKind),
}

/// Codec for the forward direction.
#[derive(Debug, Default)]
pub struct DataFrameCodec;

impl Encoder<ChannelFrame> for DataFrameCodec {
    type Error = EngineError;

    fn encode(&mut self, frame: ChannelFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            ChannelFrame::Data(frame) => {
                let length = DATA_HEADER + frame.payload.len();
                dst.reserve(4 + length);
                dst.put_u32(length as u32);
                dst.put_u64(frame.origin);
                dst.put_u64(frame.seq);
                dst.put_u64(frame.watermark);
                dst.put_u32(frame.tuple_count);
                dst.put_slice(&frame.payload);
            }
            ChannelFrame::EndOfStream(kind) => {
                dst.reserve(5);
                dst.put_u32(1);
                dst.put_u8(match kind {
                    TerminationKind::Graceful => 0,
                    TerminationKind::HardStop => 1,
                    TerminationKind::Failure => 2,
                });
            }
        }
        Ok(())
    }
}

impl Decoder for DataFrameCodec {
    type Item = ChannelFrame;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > MAX_FRAME {
            return Err(EngineError::protocol(format!(
                "frame length {length} exceeds the {MAX_FRAME} byte limit"
            )));
        }
        if length != 1 && length < DATA_HEADER {
            return Err(EngineError::protocol(format!(
                "frame length {length} shorter than the {DATA_HEADER} byte header"
            )));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }
        src.advance(4);
        if length == 1 {
            let kind = match src.get_u8() {
                0 => TerminationKind::Graceful,
                1 => TerminationKind::HardStop,
                2 => TerminationKind::Failure,
                other => {
                    return Err(EngineError::protocol(format!(
                        "unknown termination kind {other} in end-of-stream frame"
                    )))
                }
            };
            return Ok(Some(ChannelFrame::EndOfStream(kind)));
        }
        let origin = src.get_u64();
        let seq = src.get_u64();
        let watermark = src.get_u64();
        let tuple_count = src.get_u32();
        let payload = src.split_to(length - DATA_HEADER).freeze();
        Ok(Some(ChannelFrame::Data(DataFrame {
            origin,
            seq,
            watermark,
            tuple_count,
            payload,
        })))
    }
}

/// What flows receiver -> sender on the event-only reverse channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFrame {
    StartSource,
    PropagateEpoch { query_id: u64, epoch_ts: u64 },
}

const EVENT_START_SOURCE: u8 = 1;
const EVENT_PROPAGATE_EPOCH: u8 = 2;

/// Codec for the reverse direction.
#[derive(Debug, Default)]
pub struct EventFrameCodec;

impl Encoder<EventFrame> for EventFrameCodec {
    type Error = EngineError;

    fn encode(&mut self, frame: EventFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            EventFrame::StartSource => {
                dst.reserve(1);
                dst.put_u8(EVENT_START_SOURCE);
            }
            EventFrame::PropagateEpoch { query_id, epoch_ts } => {
                dst.reserve(17);
                dst.put_u8(EVENT_PROPAGATE_EPOCH);
                dst.put_u64(query_id);
                dst.put_u64(epoch_ts);
            }
        }
        Ok(())
    }
}

impl Decoder for EventFrameCodec {
    type Item = EventFrame;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        match src[0] {
            EVENT_START_SOURCE => {
                src.advance(1);
                Ok(Some(EventFrame::StartSource))
            }
            EVENT_PROPAGATE_EPOCH => {
                if src.len() < 17 {
                    return Ok(None);
                }
                src.advance(1);
                let query_id = src.get_u64();
                let epoch_ts = src.get_u64();
                Ok(Some(EventFrame::PropagateEpoch { query_id, epoch_ts }))
            }
            other => Err(EngineError::protocol(format!(
                "unknown event kind {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_data(frame: ChannelFrame) -> ChannelFrame {
        let mut codec = DataFrameCodec;
        let mut bytes = BytesMut::new();
        codec.encode(frame, &mut bytes).unwrap();
        codec.decode(&mut bytes).unwrap().unwrap()
    }

    #[test]
    fn data_frame_roundtrips() {
        let frame = ChannelFrame::Data(DataFrame {
            origin: 3,
            seq: 17,
            watermark: 5000,
            tuple_count: 2,
            payload: Bytes::from_static(b"abcdef"),
        });
        assert_eq!(roundtrip_data(frame.clone()), frame);
    }

    #[test]
    fn eos_marker_roundtrips() {
        for kind in [
            TerminationKind::Graceful,
            TerminationKind::HardStop,
            TerminationKind::Failure,
        ] {
            assert_eq!(
                roundtrip_data(ChannelFrame::EndOfStream(kind)),
                ChannelFrame::EndOfStream(kind)
            );
        }
    }

    #[test]
    fn partial_data_frame_waits_for_more_bytes() {
        let mut codec = DataFrameCodec;
        let mut bytes = BytesMut::new();
        codec
            .encode(
                ChannelFrame::Data(DataFrame {
                    origin: 1,
                    seq: 1,
                    watermark: 0,
                    tuple_count: 1,
                    payload: Bytes::from_static(b"xyz"),
                }),
                &mut bytes,
            )
            .unwrap();
        let mut truncated = bytes.split_to(bytes.len() - 2);
        assert!(codec.decode(&mut truncated).unwrap().is_none());
        truncated.unsplit(bytes);
        assert!(codec.decode(&mut truncated).unwrap().is_some());
    }

    #[test]
    fn short_length_is_a_protocol_violation() {
        let mut codec = DataFrameCodec;
        let mut bytes = BytesMut::new();
        bytes.put_u32(7); // shorter than the 28-byte header, not an EoS marker
        bytes.put_slice(&[0; 7]);
        match codec.decode(&mut bytes) {
            Err(EngineError::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }

    #[test]
    fn oversized_length_is_a_protocol_violation() {
        let mut codec = DataFrameCodec;
        let mut bytes = BytesMut::new();
        bytes.put_u32(u32::MAX);
        match codec.decode(&mut bytes) {
            Err(EngineError::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }

    #[test]
    fn event_frames_roundtrip() {
        let mut codec = EventFrameCodec;
        let mut bytes = BytesMut::new();
        codec.encode(EventFrame::StartSource, &mut bytes).unwrap();
        codec
            .encode(
                EventFrame::PropagateEpoch {
                    query_id: 9,
                    epoch_ts: 12345,
                },
                &mut bytes,
            )
            .unwrap();
        assert_eq!(
            codec.decode(&mut bytes).unwrap().unwrap(),
            EventFrame::StartSource
        );
        assert_eq!(
            codec.decode(&mut bytes).unwrap().unwrap(),
            EventFrame::PropagateEpoch {
                query_id: 9,
                epoch_ts: 12345,
            }
        );
    }

    #[test]
    fn unknown_event_kind_is_rejected() {
        let mut codec = EventFrameCodec;
        let mut bytes = BytesMut::from(&[0xAAu8][..]);
        match codec.decode(&mut bytes) {
            Err(EngineError::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }
}
