use serde::{Deserialize, Serialize};

use constellation_proto::{CoordError, QosLevel};

/// One bus frame on the wire. Data frames travel on their topic; ack frames
/// travel on the original sender's ack topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusFrame {
    Data(DataFrame),
    Ack(AckFrame),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    pub sender_id: String,
    pub topic: String,
    /// Monotone per-(sender, topic) sequence number. Zero for
    /// at-most-once frames, which carry no ordering guarantee.
    pub seq: u64,
    pub qos: QosLevel,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub acker_id: String,
    pub sender_id: String,
    pub topic: String,
    pub seq: u64,
}

impl BusFrame {
    pub fn encode(&self) -> Result<Vec<u8>, CoordError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoordError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trips() {
        let frame = BusFrame::Data(DataFrame {
            sender_id: "sat-a".to_string(),
            topic: "health/summary".to_string(),
            seq: 7,
            qos: QosLevel::AtLeastOnce,
            payload: vec![1, 2, 3],
        });
        let bytes = frame.encode().expect("encode");
        assert_eq!(BusFrame::decode(&bytes).expect("decode"), frame);
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(BusFrame::decode(b"{not json").is_err());
    }
}
