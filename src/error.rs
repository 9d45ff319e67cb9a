//! Consumer error taxonomy and outcome types.
//!
//! Only the kinds in [`DcpError`] ever cross the boundary to the host.
//! The internal "buffered, retry through the processor" and "this outbound
//! source has nothing" signals are modelled as `Ok` variants and `None`
//! respectively, never as errors.

use thiserror::Error;

/// Failure kinds surfaced to the host wire layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DcpError {
    /// The connection must be torn down. Sticky: once raised, every
    /// subsequent call on the consumer short-circuits with this.
    #[error("connection marked for disconnect")]
    Disconnect,

    /// Malformed inbound call: zero seqno, inverted snapshot range, or a
    /// misshapen response body.
    #[error("invalid request: {0}")]
    Invalid(&'static str),

    /// Unknown opaque, or no live stream for the partition.
    #[error("no stream matches this opaque and partition")]
    NoStream,

    /// A live stream already exists for the partition.
    #[error("a live stream already exists for this partition")]
    StreamExists,

    /// The partition is missing, or in a state that cannot accept a
    /// replica stream.
    #[error("partition missing or not replica-capable")]
    NotMyVbucket,

    /// Allocation failure while building a message.
    #[error("out of memory building the message")]
    Oom,

    /// The consumer rejects this operation outright.
    #[error("operation not supported")]
    NotSupported,

    /// Sequence number outside the expected snapshot window; the message
    /// was dropped.
    #[error("sequence number outside the expected window")]
    Range,
}

/// Boundary result alias.
pub type EngineResult<T = ()> = Result<T, DcpError>;

/// Result of one `step()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A message was handed to the producers; call `step` again
    /// immediately.
    WantMore,
    /// Every outbound source declined; the connection is paused and the
    /// host should wait for a readiness notification.
    Idle,
}

/// How a stream disposed of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Received {
    /// Applied synchronously; the caller credits flow control now.
    Consumed,
    /// Parked on the stream buffer; the processor task credits the bytes
    /// when it drains.
    Buffered,
}

/// Aggregate outcome of a buffered-message drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Queue empty after this pass.
    AllProcessed,
    /// Work remains but the pass yielded.
    MoreToProcess,
    /// The replication throttle refused admission; back off.
    CannotProcess,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_render() {
        assert_eq!(
            DcpError::Disconnect.to_string(),
            "connection marked for disconnect"
        );
        assert_eq!(
            DcpError::Invalid("zero seqno").to_string(),
            "invalid request: zero seqno"
        );
    }
}
