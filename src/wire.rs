//! Producer-response header and bit-exact body parsing.
//!
//! Two body shapes must match the wire exactly: a rollback response carries
//! one 8-byte big-endian seqno, and a stream-request success carries the
//! partition's failover log as a non-empty sequence of 16-byte records
//! (8-byte big-endian uuid, 8-byte big-endian seqno).

use bytes::Bytes;
use thiserror::Error;

use crate::failover::FailoverEntry;

/// Size of one failover-log record on the wire.
pub const FAILOVER_ENTRY_BYTES: usize = 16;
/// Size of a rollback-seqno body on the wire.
pub const ROLLBACK_BODY_BYTES: usize = 8;

/// Response opcodes the consumer reacts to. Anything else forces a
/// disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOpcode {
    StreamRequest,
    BufferAcknowledgement,
    Control,
    Other(u8),
}

/// Protocol status code carried on a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseStatus(pub u16);

impl ResponseStatus {
    pub const SUCCESS: ResponseStatus = ResponseStatus(0x00);
    pub const ROLLBACK: ResponseStatus = ResponseStatus(0x23);

    pub fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

/// A producer response as handed over by the host wire layer, header
/// already split from body.
#[derive(Debug, Clone)]
pub struct ProducerResponse {
    pub opcode: ResponseOpcode,
    pub opaque: u32,
    pub status: ResponseStatus,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("rollback body must be exactly {ROLLBACK_BODY_BYTES} bytes, got {got}")]
    BadRollbackBody { got: usize },
    #[error("failover log body must be a non-empty multiple of {FAILOVER_ENTRY_BYTES} bytes, got {got}")]
    BadFailoverBody { got: usize },
}

/// Parse the 8-byte big-endian rollback seqno.
pub fn parse_rollback_seqno(body: &[u8]) -> Result<u64, WireError> {
    let bytes: [u8; ROLLBACK_BODY_BYTES] = body
        .try_into()
        .map_err(|_| WireError::BadRollbackBody { got: body.len() })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Parse a failover-log body into its (uuid, seqno) entries, newest first
/// as sent by the producer.
pub fn parse_failover_log(body: &[u8]) -> Result<Vec<FailoverEntry>, WireError> {
    if body.is_empty() || body.len() % FAILOVER_ENTRY_BYTES != 0 {
        return Err(WireError::BadFailoverBody { got: body.len() });
    }

    let entries = body
        .chunks_exact(FAILOVER_ENTRY_BYTES)
        .map(|chunk| {
            let uuid = u64::from_be_bytes(chunk[..8].try_into().expect("8-byte slice"));
            let seqno = u64::from_be_bytes(chunk[8..].try_into().expect("8-byte slice"));
            FailoverEntry { uuid, seqno }
        })
        .collect();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_seqno_is_big_endian() {
        let body = 42u64.to_be_bytes();
        assert_eq!(parse_rollback_seqno(&body), Ok(42));
    }

    #[test]
    fn rollback_body_must_be_eight_bytes() {
        assert_eq!(
            parse_rollback_seqno(&[0u8; 7]),
            Err(WireError::BadRollbackBody { got: 7 })
        );
        assert_eq!(
            parse_rollback_seqno(&[0u8; 9]),
            Err(WireError::BadRollbackBody { got: 9 })
        );
    }

    #[test]
    fn failover_log_round_trips_entries() {
        let mut body = Vec::new();
        body.extend_from_slice(&0x1111_2222_3333_4444u64.to_be_bytes());
        body.extend_from_slice(&10u64.to_be_bytes());
        body.extend_from_slice(&0x5555_6666_7777_8888u64.to_be_bytes());
        body.extend_from_slice(&0u64.to_be_bytes());

        let entries = parse_failover_log(&body).expect("parse");
        assert_eq!(
            entries,
            vec![
                FailoverEntry {
                    uuid: 0x1111_2222_3333_4444,
                    seqno: 10
                },
                FailoverEntry {
                    uuid: 0x5555_6666_7777_8888,
                    seqno: 0
                },
            ]
        );
    }

    #[test]
    fn failover_log_rejects_empty_and_ragged_bodies() {
        assert_eq!(
            parse_failover_log(&[]),
            Err(WireError::BadFailoverBody { got: 0 })
        );
        assert_eq!(
            parse_failover_log(&[0u8; 24]),
            Err(WireError::BadFailoverBody { got: 24 })
        );
    }
}
