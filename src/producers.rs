//! Outbound message sink supplied by the host.
//!
//! One implementation exists per connection; the host serialises calls, so
//! the trait takes `&mut self`. Every method maps to one wire message.

use crate::error::EngineResult;
use crate::message::Vbid;
use crate::wire::ResponseStatus;

pub trait MessageProducers {
    /// Request a stream for a partition, resuming from the given branch.
    #[allow(clippy::too_many_arguments)]
    fn stream_req(
        &mut self,
        opaque: u32,
        vbid: Vbid,
        flags: u32,
        start_seqno: u64,
        end_seqno: u64,
        vbucket_uuid: u64,
        snap_start_seqno: u64,
        snap_end_seqno: u64,
    ) -> EngineResult;

    /// Answer the host's add-stream call.
    fn add_stream_rsp(
        &mut self,
        external_opaque: u32,
        stream_opaque: u32,
        status: ResponseStatus,
    ) -> EngineResult;

    /// Acknowledge an applied set-vbucket-state.
    fn set_vbucket_state_rsp(&mut self, opaque: u32, status: ResponseStatus) -> EngineResult;

    /// Acknowledge a snapshot marker that requested one.
    fn marker_rsp(&mut self, opaque: u32, status: ResponseStatus) -> EngineResult;

    /// Return `buffer_bytes` of receive window to the producer.
    fn buffer_ack(&mut self, opaque: u32, buffer_bytes: u32) -> EngineResult;

    /// Feature-negotiation control message.
    fn control(&mut self, opaque: u32, key: &str, value: &[u8]) -> EngineResult;
}
