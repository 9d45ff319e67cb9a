//! Protocol message variants and their flow-control byte costs.
//!
//! Every consumer-side message is one arm of [`DcpMessage`]. Each arm knows
//! its own wire footprint (`message_size`), which is the unit of account for
//! the flow-control window: the producer is owed exactly these bytes back
//! once the message has been processed.

use std::fmt;

use bytes::Bytes;

use crate::wire::ResponseStatus;

/// Wire header length shared by every message.
const HEADER_BYTES: u32 = 24;

/// Base wire cost per message kind: header plus fixed extras.
pub const STREAM_REQUEST_BASE_BYTES: u32 = HEADER_BYTES + 48;
pub const ADD_STREAM_RSP_BASE_BYTES: u32 = HEADER_BYTES + 4;
pub const SNAPSHOT_MARKER_BASE_BYTES: u32 = HEADER_BYTES + 20;
pub const SET_VBUCKET_STATE_BASE_BYTES: u32 = HEADER_BYTES + 1;
pub const STREAM_END_BASE_BYTES: u32 = HEADER_BYTES + 4;
pub const SET_VBUCKET_STATE_RSP_BASE_BYTES: u32 = HEADER_BYTES;
pub const SNAPSHOT_MARKER_RSP_BASE_BYTES: u32 = HEADER_BYTES;
pub const MUTATION_BASE_BYTES: u32 = HEADER_BYTES + 31;
pub const DELETION_BASE_BYTES: u32 = HEADER_BYTES + 18;

/// Stream-request flag: the stream is a takeover transfer.
pub const ADD_STREAM_FLAG_TAKEOVER: u32 = 0x01;
/// Stream-request flag: disk-only backfill.
pub const ADD_STREAM_FLAG_DISKONLY: u32 = 0x02;

/// Partition identifier. The partition space is bounded by the configured
/// `max_vbuckets`; streams are indexed by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vbid(u16);

impl Vbid {
    pub fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition lifecycle state as dictated by the cluster manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl VBucketState {
    pub fn as_str(self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }
}

/// Why a producer ended a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    /// All requested items were streamed.
    Ok,
    /// The stream closed early due to a close-stream message.
    Closed,
    /// The partition state changed out from under the stream.
    StateChanged,
    /// The connection was disconnected.
    Disconnected,
    /// The producer dropped a reader the consumer was too slow to follow;
    /// the consumer should reconnect.
    Slow,
}

impl StreamEndReason {
    pub fn describe(self) -> &'static str {
        match self {
            StreamEndReason::Ok => "the stream closed as part of normal operation",
            StreamEndReason::Closed => "the stream closed due to a close stream message",
            StreamEndReason::StateChanged => {
                "the stream closed early because the vbucket state changed"
            }
            StreamEndReason::Disconnected => {
                "the stream closed early because the conn was disconnected"
            }
            StreamEndReason::Slow => {
                "the producer dropped the stream because the consumer was too slow"
            }
        }
    }
}

/// Snapshot-marker flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkerFlags(pub u32);

impl MarkerFlags {
    pub const MEMORY: u32 = 0x01;
    pub const DISK: u32 = 0x02;
    pub const CHK: u32 = 0x04;
    pub const ACK: u32 = 0x08;

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Whether a mutation message carries a write, a delete, or an expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Mutation,
    Deletion,
    Expiration,
}

/// Body of a mutation/deletion/expiration message. Deletions carry an
/// empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationPayload {
    pub key: Bytes,
    pub value: Bytes,
    pub cas: u64,
    pub flags: u32,
    pub datatype: u8,
    pub locktime: u32,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub exptime: u32,
    pub nru: u8,
    pub meta: Option<Bytes>,
}

impl MutationPayload {
    fn meta_len(&self) -> u32 {
        self.meta.as_ref().map_or(0, |m| m.len() as u32)
    }
}

/// Tagged variant over every message the consumer queues, inbound or
/// outbound. The per-arm byte cost is the flow-control unit of account.
#[derive(Debug, Clone, PartialEq)]
pub enum DcpMessage {
    /// Outbound: ask the producer to open a stream.
    StreamRequest {
        opaque: u32,
        vbid: Vbid,
        flags: u32,
        start_seqno: u64,
        end_seqno: u64,
        vbucket_uuid: u64,
        snap_start_seqno: u64,
        snap_end_seqno: u64,
    },
    /// Outbound: answer the host's add-stream call once the producer has
    /// accepted or rejected the stream.
    AddStreamResponse {
        external_opaque: u32,
        stream_opaque: u32,
        status: ResponseStatus,
    },
    /// Outbound: acknowledge an applied set-vbucket-state.
    SetVBucketStateResponse {
        opaque: u32,
        status: ResponseStatus,
    },
    /// Outbound: acknowledge a snapshot the producer asked to be acked.
    SnapshotMarkerResponse {
        opaque: u32,
        status: ResponseStatus,
    },
    /// Inbound: brackets a [start, end] window of seqnos delivered as one
    /// atomic unit.
    SnapshotMarker {
        opaque: u32,
        vbid: Vbid,
        start_seqno: u64,
        end_seqno: u64,
        flags: MarkerFlags,
    },
    /// Inbound: a mutation, deletion, or expiration within the current
    /// snapshot.
    Mutation {
        opaque: u32,
        vbid: Vbid,
        kind: MutationKind,
        payload: MutationPayload,
    },
    /// Inbound: the cluster manager changed the partition state.
    SetVBucketState {
        opaque: u32,
        vbid: Vbid,
        state: VBucketState,
    },
    /// Inbound: the producer ended the stream.
    StreamEnd {
        opaque: u32,
        vbid: Vbid,
        reason: StreamEndReason,
    },
}

impl DcpMessage {
    /// Wire footprint of this message in bytes; the amount owed back to the
    /// producer's flow-control window once processed.
    pub fn message_size(&self) -> u32 {
        match self {
            DcpMessage::StreamRequest { .. } => STREAM_REQUEST_BASE_BYTES,
            DcpMessage::AddStreamResponse { .. } => ADD_STREAM_RSP_BASE_BYTES,
            DcpMessage::SetVBucketStateResponse { .. } => SET_VBUCKET_STATE_RSP_BASE_BYTES,
            DcpMessage::SnapshotMarkerResponse { .. } => SNAPSHOT_MARKER_RSP_BASE_BYTES,
            DcpMessage::SnapshotMarker { .. } => SNAPSHOT_MARKER_BASE_BYTES,
            DcpMessage::Mutation { kind, payload, .. } => {
                let key = payload.key.len() as u32;
                let meta = payload.meta_len();
                match kind {
                    MutationKind::Mutation => {
                        MUTATION_BASE_BYTES + key + meta + payload.value.len() as u32
                    }
                    MutationKind::Deletion | MutationKind::Expiration => {
                        DELETION_BASE_BYTES + key + meta
                    }
                }
            }
            DcpMessage::SetVBucketState { .. } => SET_VBUCKET_STATE_BASE_BYTES,
            DcpMessage::StreamEnd { .. } => STREAM_END_BASE_BYTES,
        }
    }

    /// Short tag for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            DcpMessage::StreamRequest { .. } => "stream_request",
            DcpMessage::AddStreamResponse { .. } => "add_stream_response",
            DcpMessage::SetVBucketStateResponse { .. } => "set_vbucket_state_response",
            DcpMessage::SnapshotMarkerResponse { .. } => "snapshot_marker_response",
            DcpMessage::SnapshotMarker { .. } => "snapshot_marker",
            DcpMessage::Mutation { kind, .. } => match kind {
                MutationKind::Mutation => "mutation",
                MutationKind::Deletion => "deletion",
                MutationKind::Expiration => "expiration",
            },
            DcpMessage::SetVBucketState { .. } => "set_vbucket_state",
            DcpMessage::StreamEnd { .. } => "stream_end",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key_len: usize, value_len: usize, meta_len: Option<usize>) -> MutationPayload {
        MutationPayload {
            key: Bytes::from(vec![b'k'; key_len]),
            value: Bytes::from(vec![b'v'; value_len]),
            cas: 0,
            flags: 0,
            datatype: 0,
            locktime: 0,
            by_seqno: 1,
            rev_seqno: 1,
            exptime: 0,
            nru: 0,
            meta: meta_len.map(|n| Bytes::from(vec![b'm'; n])),
        }
    }

    #[test]
    fn mutation_size_includes_key_value_and_meta() {
        let msg = DcpMessage::Mutation {
            opaque: 1,
            vbid: Vbid::new(0),
            kind: MutationKind::Mutation,
            payload: payload(4, 8, Some(3)),
        };
        assert_eq!(msg.message_size(), MUTATION_BASE_BYTES + 4 + 8 + 3);
    }

    #[test]
    fn deletion_size_ignores_value() {
        let msg = DcpMessage::Mutation {
            opaque: 1,
            vbid: Vbid::new(0),
            kind: MutationKind::Deletion,
            payload: payload(4, 8, None),
        };
        assert_eq!(msg.message_size(), DELETION_BASE_BYTES + 4);
    }

    #[test]
    fn expiration_costs_like_deletion() {
        let del = DcpMessage::Mutation {
            opaque: 1,
            vbid: Vbid::new(0),
            kind: MutationKind::Deletion,
            payload: payload(2, 0, Some(5)),
        };
        let exp = DcpMessage::Mutation {
            opaque: 1,
            vbid: Vbid::new(0),
            kind: MutationKind::Expiration,
            payload: payload(2, 0, Some(5)),
        };
        assert_eq!(del.message_size(), exp.message_size());
    }

    #[test]
    fn fixed_size_messages() {
        let marker = DcpMessage::SnapshotMarker {
            opaque: 1,
            vbid: Vbid::new(0),
            start_seqno: 1,
            end_seqno: 2,
            flags: MarkerFlags(MarkerFlags::MEMORY),
        };
        assert_eq!(marker.message_size(), 44);

        let end = DcpMessage::StreamEnd {
            opaque: 1,
            vbid: Vbid::new(0),
            reason: StreamEndReason::Ok,
        };
        assert_eq!(end.message_size(), 28);

        let req = DcpMessage::StreamRequest {
            opaque: 1,
            vbid: Vbid::new(0),
            flags: 0,
            start_seqno: 0,
            end_seqno: u64::MAX,
            vbucket_uuid: 0,
            snap_start_seqno: 0,
            snap_end_seqno: 0,
        };
        assert_eq!(req.message_size(), 72);
    }

    #[test]
    fn marker_flags() {
        let flags = MarkerFlags(MarkerFlags::DISK | MarkerFlags::CHK);
        assert!(flags.has(MarkerFlags::DISK));
        assert!(flags.has(MarkerFlags::CHK));
        assert!(!flags.has(MarkerFlags::ACK));
    }
}
