//! Peer wire messages.
//!
//! Every WebSocket binary frame carries exactly one [`PeerMessage`],
//! encoded as CBOR. A connection always starts with the dialer sending
//! `Hello` and the acceptor answering `Welcome`.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::ChangeRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A frame exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// First frame from the dialing side.
    Hello {
        /// Node id of the dialer.
        node_id: String,
        /// Identifies the dialer's sequence space; new per process run.
        session_id: Uuid,
    },
    /// Reply from the accepting side.
    Welcome {
        /// Node id of the acceptor.
        node_id: String,
        /// Highest sequence already applied for the dialer's session.
        last_applied_seq: u64,
    },
    /// A propagated change.
    Change {
        /// Sequence number, strictly increasing per dialer session.
        seq: u64,
        /// The change.
        record: ChangeRecord,
    },
    /// Cumulative acknowledgement of every sequence up to `seq`.
    Ack {
        /// Highest acknowledged sequence.
        seq: u64,
    },
}

impl PeerMessage {
    /// Returns a numeric code for the message type.
    pub fn type_code(&self) -> u8 {
        match self {
            PeerMessage::Hello { .. } => 1,
            PeerMessage::Welcome { .. } => 2,
            PeerMessage::Change { .. } => 3,
            PeerMessage::Ack { .. } => 4,
        }
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ColumnValue, PrimaryKey, Row};

    fn sample_record() -> ChangeRecord {
        let mut row = Row::new();
        row.insert("id".into(), ColumnValue::Integer(9));
        row.insert("score".into(), ColumnValue::Real(0.5));
        row.insert("body".into(), ColumnValue::Blob(vec![0, 1, 2]));
        row.insert("note".into(), ColumnValue::Null);
        ChangeRecord::new("pair", "scripts", PrimaryKey::single(9), row, "primary", 1234)
    }

    #[test]
    fn change_frame_preserves_record() {
        let message = PeerMessage::Change {
            seq: 7,
            record: sample_record(),
        };
        let bytes = message.encode().unwrap();
        let decoded = PeerMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, message);

        let PeerMessage::Change { record, .. } = decoded else {
            panic!("expected change frame");
        };
        assert_eq!(record.content_hash, sample_record().content_hash);
    }

    #[test]
    fn handshake_frames() {
        let hello = PeerMessage::Hello {
            node_id: "node-a".into(),
            session_id: Uuid::new_v4(),
        };
        let decoded = PeerMessage::decode(&hello.encode().unwrap()).unwrap();
        assert_eq!(decoded, hello);

        let welcome = PeerMessage::Welcome {
            node_id: "node-b".into(),
            last_applied_seq: 41,
        };
        let decoded = PeerMessage::decode(&welcome.encode().unwrap()).unwrap();
        assert_eq!(decoded, welcome);
    }

    #[test]
    fn garbage_is_a_decoding_error() {
        assert!(matches!(
            PeerMessage::decode(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::Decoding(_))
        ));
    }

    #[test]
    fn type_codes() {
        assert_eq!(PeerMessage::Ack { seq: 1 }.type_code(), 4);
        assert_eq!(
            PeerMessage::Change {
                seq: 1,
                record: sample_record()
            }
            .type_code(),
            3
        );
    }
}
