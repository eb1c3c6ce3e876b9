//! Wire format (§6): byte-exact little-endian framing for the one-way,
//! ordered network channel (§4.8).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{Result, RuntimeError};

const WIRE_VERSION: u8 = 1;
const FRAME_TYPE_DATA: u8 = 0;
const FRAME_TYPE_EVENT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Data = 0,
    EventOnly = 1,
}

impl ChannelType {
    fn from_u16(v: u16) -> Result<Self> {
        match v {
            0 => Ok(ChannelType::Data),
            1 => Ok(ChannelType::EventOnly),
            other => Err(RuntimeError::CannotDeserialize(format!("unknown channelType {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub channel_type: ChannelType,
    pub channel_id: Uuid,
    pub seq: u64,
    pub number_of_tuples: u32,
    pub origin_id: u64,
    pub watermark_ts: u64,
    pub sequence_number_log: u64,
    pub chunk_number: u32,
    pub last_chunk: bool,
    pub payload: Bytes,
}

impl DataFrame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64 + self.payload.len());
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(FRAME_TYPE_DATA);
        buf.put_u16_le(self.channel_type as u16);
        let (hi, lo) = channel_id_to_u64_pair(self.channel_id);
        buf.put_u64_le(lo);
        buf.put_u64_le(hi);
        buf.put_u64_le(self.seq);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(self.number_of_tuples);
        buf.put_u64_le(self.origin_id);
        buf.put_u64_le(self.watermark_ts);
        buf.put_u64_le(self.sequence_number_log);
        buf.put_u32_le(self.chunk_number);
        buf.put_u8(self.last_chunk as u8);
        buf.put_slice(&self.payload);
        buf
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        require_remaining(&bytes, 1 + 1 + 2 + 8 + 8 + 8 + 4 + 4 + 8 + 8 + 8 + 4 + 1)?;
        let version = bytes.get_u8();
        if version != WIRE_VERSION {
            return Err(RuntimeError::CannotDeserialize(format!("unsupported version {version}")));
        }
        let frame_type = bytes.get_u8();
        if frame_type != FRAME_TYPE_DATA {
            return Err(RuntimeError::CannotDeserialize(format!(
                "expected Data frame (0), got {frame_type}"
            )));
        }
        let channel_type = ChannelType::from_u16(bytes.get_u16_le())?;
        let lo = bytes.get_u64_le();
        let hi = bytes.get_u64_le();
        let channel_id = channel_id_from_u64_pair(hi, lo);
        let seq = bytes.get_u64_le();
        let payload_size = bytes.get_u32_le() as usize;
        let number_of_tuples = bytes.get_u32_le();
        let origin_id = bytes.get_u64_le();
        let watermark_ts = bytes.get_u64_le();
        let sequence_number_log = bytes.get_u64_le();
        let chunk_number = bytes.get_u32_le();
        let last_chunk = bytes.get_u8() != 0;
        require_remaining(&bytes, payload_size)?;
        let payload = bytes.copy_to_bytes(payload_size);
        Ok(Self {
            channel_type,
            channel_id,
            seq,
            number_of_tuples,
            origin_id,
            watermark_ts,
            sequence_number_log,
            chunk_number,
            last_chunk,
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    EndOfStream = 0,
    Reconfiguration = 1,
    Error = 2,
}

impl EventKind {
    fn from_u16(v: u16) -> Result<Self> {
        match v {
            0 => Ok(EventKind::EndOfStream),
            1 => Ok(EventKind::Reconfiguration),
            2 => Ok(EventKind::Error),
            other => Err(RuntimeError::CannotDeserialize(format!("unknown event kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationType {
    Graceful = 0,
    Hard = 1,
    Failure = 2,
    Reconfiguration = 3,
}

impl TerminationType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(TerminationType::Graceful),
            1 => Ok(TerminationType::Hard),
            2 => Ok(TerminationType::Failure),
            3 => Ok(TerminationType::Reconfiguration),
            other => Err(RuntimeError::CannotDeserialize(format!("unknown terminationType {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataType {
    Drain = 0,
    Update = 1,
    UpdateAndDrain = 2,
}

impl MetadataType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(MetadataType::Drain),
            1 => Ok(MetadataType::Update),
            2 => Ok(MetadataType::UpdateAndDrain),
            other => Err(RuntimeError::CannotDeserialize(format!("unknown metadataType {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconfigurationEvent {
    pub query_state: u8,
    pub metadata_type: MetadataType,
    pub number_of_sources: u16,
    pub worker_id: u64,
    pub shared_query_id: u64,
    pub decomposed_query_id: u64,
    pub decomposed_query_plan_version: u32,
}

impl ReconfigurationEvent {
    const ENCODED_LEN: usize = 1 + 1 + 2 + 8 + 8 + 8 + 4;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.query_state);
        buf.put_u8(self.metadata_type as u8);
        buf.put_u16_le(self.number_of_sources);
        buf.put_u64_le(self.worker_id);
        buf.put_u64_le(self.shared_query_id);
        buf.put_u64_le(self.decomposed_query_id);
        buf.put_u32_le(self.decomposed_query_plan_version);
    }

    fn decode_from(bytes: &mut Bytes) -> Result<Self> {
        require_remaining(bytes, Self::ENCODED_LEN)?;
        Ok(Self {
            query_state: bytes.get_u8(),
            metadata_type: MetadataType::from_u8(bytes.get_u8())?,
            number_of_sources: bytes.get_u16_le(),
            worker_id: bytes.get_u64_le(),
            shared_query_id: bytes.get_u64_le(),
            decomposed_query_id: bytes.get_u64_le(),
            decomposed_query_plan_version: bytes.get_u32_le(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub kind: EventKind,
    pub channel_id: Uuid,
    pub seq: u64,
    pub termination_type: TerminationType,
    pub num_sending_threads: u16,
    pub reconfiguration_events: Vec<ReconfigurationEvent>,
}

impl EventFrame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(40 + self.reconfiguration_events.len() * ReconfigurationEvent::ENCODED_LEN);
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(FRAME_TYPE_EVENT);
        buf.put_u16_le(self.kind as u16);
        let (hi, lo) = channel_id_to_u64_pair(self.channel_id);
        buf.put_u128_le(((hi as u128) << 64) | lo as u128);
        buf.put_u64_le(self.seq);
        buf.put_u8(self.termination_type as u8);
        buf.put_u16_le(self.num_sending_threads);
        buf.put_u16_le(self.reconfiguration_events.len() as u16);
        for event in &self.reconfiguration_events {
            event.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        require_remaining(&bytes, 1 + 1 + 2 + 16 + 8 + 1 + 2 + 2)?;
        let version = bytes.get_u8();
        if version != WIRE_VERSION {
            return Err(RuntimeError::CannotDeserialize(format!("unsupported version {version}")));
        }
        let frame_type = bytes.get_u8();
        if frame_type != FRAME_TYPE_EVENT {
            return Err(RuntimeError::CannotDeserialize(format!(
                "expected Event frame (1), got {frame_type}"
            )));
        }
        let kind = EventKind::from_u16(bytes.get_u16_le())?;
        let packed = bytes.get_u128_le();
        let channel_id = channel_id_from_u64_pair((packed >> 64) as u64, packed as u64);
        let seq = bytes.get_u64_le();
        let termination_type = TerminationType::from_u8(bytes.get_u8())?;
        let num_sending_threads = bytes.get_u16_le();
        let pending_event_count = bytes.get_u16_le();
        let mut reconfiguration_events = Vec::with_capacity(pending_event_count as usize);
        for _ in 0..pending_event_count {
            reconfiguration_events.push(ReconfigurationEvent::decode_from(&mut bytes)?);
        }
        Ok(Self {
            kind,
            channel_id,
            seq,
            termination_type,
            num_sending_threads,
            reconfiguration_events,
        })
    }
}

fn channel_id_to_u64_pair(id: Uuid) -> (u64, u64) {
    let bytes = id.as_u128();
    ((bytes >> 64) as u64, bytes as u64)
}

fn channel_id_from_u64_pair(hi: u64, lo: u64) -> Uuid {
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

fn require_remaining(bytes: &Bytes, needed: usize) -> Result<()> {
    if bytes.remaining() < needed {
        return Err(RuntimeError::CannotDeserialize(format!(
            "truncated frame: need {needed} bytes, have {}",
            bytes.remaining()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trips_byte_exactly() {
        let frame = DataFrame {
            channel_type: ChannelType::Data,
            channel_id: Uuid::new_v4(),
            seq: 42,
            number_of_tuples: 100,
            origin_id: 7,
            watermark_ts: 1000,
            sequence_number_log: 42,
            chunk_number: 1,
            last_chunk: true,
            payload: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
        };
        let encoded = frame.encode();
        let decoded = DataFrame::decode(encoded.freeze()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn event_frame_with_reconfiguration_events_round_trips() {
        let frame = EventFrame {
            kind: EventKind::Reconfiguration,
            channel_id: Uuid::new_v4(),
            seq: 9,
            termination_type: TerminationType::Reconfiguration,
            num_sending_threads: 2,
            reconfiguration_events: vec![ReconfigurationEvent {
                query_state: 1,
                metadata_type: MetadataType::UpdateAndDrain,
                number_of_sources: 3,
                worker_id: 11,
                shared_query_id: 22,
                decomposed_query_id: 33,
                decomposed_query_plan_version: 2,
            }],
        };
        let encoded = frame.encode();
        let decoded = EventFrame::decode(encoded.freeze()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn truncated_frame_is_cannot_deserialize() {
        let frame = DataFrame {
            channel_type: ChannelType::Data,
            channel_id: Uuid::new_v4(),
            seq: 1,
            number_of_tuples: 1,
            origin_id: 1,
            watermark_ts: 1,
            sequence_number_log: 1,
            chunk_number: 1,
            last_chunk: true,
            payload: Bytes::from_static(&[9, 9]),
        };
        let mut encoded = frame.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(DataFrame::decode(encoded.freeze()), Err(RuntimeError::CannotDeserialize(_))));
    }
}
