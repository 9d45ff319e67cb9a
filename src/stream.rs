//! Per-partition passive stream.
//!
//! Lifecycle: created Pending alongside an outbound stream request; Reading
//! once the producer accepts; Dead on teardown or a terminal event. Inbound
//! messages are applied synchronously when the buffer is empty and the
//! replication throttle admits, otherwise parked for the processor task.
//! Outbound responses queue on a separate ready queue drained by `step`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::consumer::DcpConsumer;
use crate::engine::{EngineBridge, StoreError, VBucket};
use crate::error::{DcpError, EngineResult, ProcessResult, Received};
use crate::message::{
    DcpMessage, MarkerFlags, MutationKind, MutationPayload, StreamEndReason, Vbid,
};
use crate::metrics;
use crate::wire::ResponseStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Pending,
    Reading,
    Dead,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Pending => "pending",
            StreamState::Reading => "reading",
            StreamState::Dead => "dead",
        }
    }
}

/// Kind of the snapshot currently being received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    None,
    Disk,
    Memory,
}

impl SnapshotType {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SnapshotType::Disk,
            2 => SnapshotType::Memory,
            _ => SnapshotType::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SnapshotType::None => 0,
            SnapshotType::Disk => 1,
            SnapshotType::Memory => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotType::None => "none",
            SnapshotType::Disk => "disk",
            SnapshotType::Memory => "memory",
        }
    }
}

/// Why one buffered message could not be applied.
enum ApplyError {
    /// Storage wants the message retried later; it stays buffered.
    Retry,
    /// Seqno outside the expected window; message dropped, bytes not
    /// credited.
    Range,
    /// Partition vanished; message dropped.
    NotMyVbucket,
}

#[derive(Debug, Default)]
struct ReadyQueue {
    queue: VecDeque<DcpMessage>,
    bytes: u64,
}

#[derive(Debug, Default)]
struct InboundBuffer {
    messages: VecDeque<DcpMessage>,
    bytes: u32,
}

/// Point-in-time view of a stream for stats export.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub vbid: Vbid,
    pub opaque: u32,
    pub flags: u32,
    pub state: &'static str,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub vb_uuid: u64,
    pub snap_start_seqno: u64,
    pub snap_end_seqno: u64,
    pub last_seqno: u64,
    pub buffer_items: usize,
    pub buffer_bytes: u32,
    pub ready_queue_bytes: u64,
    pub items_ready: bool,
    pub cur_snapshot_type: &'static str,
    pub cur_snapshot_start: u64,
    pub cur_snapshot_end: u64,
}

pub struct PassiveStream {
    name: String,
    vbid: Vbid,
    flags: u32,
    opaque: u32,
    start_seqno: AtomicU64,
    end_seqno: u64,
    vb_uuid: AtomicU64,
    snap_start_seqno: AtomicU64,
    snap_end_seqno: AtomicU64,
    state: RwLock<StreamState>,
    last_seqno: AtomicU64,
    cur_snapshot_start: AtomicU64,
    cur_snapshot_end: AtomicU64,
    cur_snapshot_type: AtomicU8,
    cur_snapshot_ack: AtomicBool,
    items_ready: AtomicBool,
    ready: Mutex<ReadyQueue>,
    buffer: Mutex<InboundBuffer>,
    consumer: Weak<DcpConsumer>,
    engine: Arc<dyn EngineBridge>,
    batch_size: usize,
}

impl PassiveStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        consumer: Weak<DcpConsumer>,
        engine: Arc<dyn EngineBridge>,
        name: String,
        flags: u32,
        opaque: u32,
        vbid: Vbid,
        start_seqno: u64,
        end_seqno: u64,
        vb_uuid: u64,
        snap_start_seqno: u64,
        snap_end_seqno: u64,
        vb_high_seqno: u64,
        batch_size: usize,
    ) -> Arc<Self> {
        let stream = Arc::new(Self {
            name,
            vbid,
            flags,
            opaque,
            start_seqno: AtomicU64::new(start_seqno),
            end_seqno,
            vb_uuid: AtomicU64::new(vb_uuid),
            snap_start_seqno: AtomicU64::new(snap_start_seqno),
            snap_end_seqno: AtomicU64::new(snap_end_seqno),
            state: RwLock::new(StreamState::Pending),
            last_seqno: AtomicU64::new(vb_high_seqno),
            cur_snapshot_start: AtomicU64::new(0),
            cur_snapshot_end: AtomicU64::new(0),
            cur_snapshot_type: AtomicU8::new(SnapshotType::None.as_u8()),
            cur_snapshot_ack: AtomicBool::new(false),
            items_ready: AtomicBool::new(false),
            ready: Mutex::new(ReadyQueue::default()),
            buffer: Mutex::new(InboundBuffer::default()),
            consumer,
            engine,
            batch_size,
        });

        {
            let mut ready = stream.ready.lock().expect("ready queue lock poisoned");
            let request = DcpMessage::StreamRequest {
                opaque,
                vbid,
                flags,
                start_seqno,
                end_seqno,
                vbucket_uuid: vb_uuid,
                snap_start_seqno,
                snap_end_seqno,
            };
            ready.bytes += u64::from(request.message_size());
            ready.queue.push_back(request);
        }
        stream.items_ready.store(true, Ordering::Release);

        tracing::info!(
            target: "dcp",
            name = %stream.name,
            vbid = %vbid,
            start_seqno,
            end_seqno,
            vb_uuid,
            snap_start_seqno,
            snap_end_seqno,
            vb_high_seqno,
            takeover = flags & crate::message::ADD_STREAM_FLAG_TAKEOVER != 0,
            "attempting to add stream"
        );
        metrics::stream_created();

        stream
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn state(&self) -> StreamState {
        *self.state.read().expect("stream state lock poisoned")
    }

    /// A stream accepts input and produces output until it is dead.
    pub fn is_active(&self) -> bool {
        self.state() != StreamState::Dead
    }

    pub fn last_seqno(&self) -> u64 {
        self.last_seqno.load(Ordering::Relaxed)
    }

    fn snapshot_type(&self) -> SnapshotType {
        SnapshotType::from_u8(self.cur_snapshot_type.load(Ordering::Relaxed))
    }

    fn transition_state(&self, to: StreamState) {
        let mut state = self.state.write().expect("stream state lock poisoned");
        if *state == to {
            return;
        }
        let valid = matches!(
            (*state, to),
            (StreamState::Pending, StreamState::Reading)
                | (StreamState::Pending, StreamState::Dead)
                | (StreamState::Reading, StreamState::Pending)
                | (StreamState::Reading, StreamState::Dead)
        );
        if !valid {
            panic!(
                "invalid passive stream transition {} -> {} (vb {})",
                state.as_str(),
                to.as_str(),
                self.vbid
            );
        }
        tracing::debug!(
            target: "dcp",
            vbid = %self.vbid,
            from = state.as_str(),
            to = to.as_str(),
            "stream transition"
        );
        *state = to;
    }

    /// Queue an outbound response and notify the consumer if the stream
    /// just became ready. The ready lock is released before notifying.
    fn push_ready_response(&self, msg: DcpMessage) {
        {
            let mut ready = self.ready.lock().expect("ready queue lock poisoned");
            ready.bytes += u64::from(msg.message_size());
            ready.queue.push_back(msg);
        }
        if !self.items_ready.swap(true, Ordering::AcqRel) {
            if let Some(consumer) = self.consumer.upgrade() {
                consumer.notify_stream_ready(self.vbid);
            }
        }
    }

    /// Producer answered the stream request: Pending → Reading on success,
    /// Pending → Dead otherwise. The add-stream response is queued either
    /// way.
    pub(crate) fn accept_stream(&self, status: ResponseStatus, add_opaque: u32) {
        if self.state() != StreamState::Pending {
            return;
        }
        if status.is_success() {
            self.transition_state(StreamState::Reading);
        } else {
            self.transition_state(StreamState::Dead);
            metrics::stream_dead();
        }
        self.push_ready_response(DcpMessage::AddStreamResponse {
            external_opaque: add_opaque,
            stream_opaque: self.opaque,
            status,
        });
    }

    /// Re-issue the stream request from `start_seqno`, refreshing the
    /// branch uuid and snapshot range from the partition.
    pub(crate) fn reconnect_stream(&self, vb: &VBucket, new_opaque: u32, start_seqno: u64) {
        self.vb_uuid
            .store(vb.latest_failover_entry().uuid, Ordering::Relaxed);

        let mut info = vb.snapshot_info();
        if info.range.end == info.start {
            info.range.start = info.start;
        }
        self.snap_start_seqno.store(info.range.start, Ordering::Relaxed);
        self.start_seqno.store(info.start, Ordering::Relaxed);
        self.snap_end_seqno.store(info.range.end, Ordering::Relaxed);

        tracing::info!(
            target: "dcp",
            vbid = %self.vbid,
            opaque = new_opaque,
            start_seqno,
            end_seqno = self.end_seqno,
            snap_start_seqno = info.range.start,
            snap_end_seqno = info.range.end,
            "attempting to reconnect stream"
        );

        self.last_seqno.store(start_seqno, Ordering::Relaxed);
        self.push_ready_response(DcpMessage::StreamRequest {
            opaque: new_opaque,
            vbid: self.vbid,
            flags: self.flags,
            start_seqno,
            end_seqno: self.end_seqno,
            vbucket_uuid: self.vb_uuid.load(Ordering::Relaxed),
            snap_start_seqno: self.snap_start_seqno.load(Ordering::Relaxed),
            snap_end_seqno: self.snap_end_seqno.load(Ordering::Relaxed),
        });
    }

    /// Terminal transition. Clears the inbound buffer and returns the
    /// un-acked bytes it held so the caller can return them to the
    /// flow-control window.
    pub(crate) fn set_dead(&self, reason: StreamEndReason) -> u32 {
        if self.state() != StreamState::Dead {
            self.transition_state(StreamState::Dead);
            metrics::stream_dead();
        }
        let unacked = self.clear_buffer();
        if reason == StreamEndReason::Disconnected {
            tracing::warn!(
                target: "dcp",
                vbid = %self.vbid,
                last_seqno = self.last_seqno(),
                unacked_bytes = unacked,
                reason = reason.describe(),
                "setting stream to dead state"
            );
        } else {
            tracing::info!(
                target: "dcp",
                vbid = %self.vbid,
                last_seqno = self.last_seqno(),
                unacked_bytes = unacked,
                reason = reason.describe(),
                "setting stream to dead state"
            );
        }
        unacked
    }

    fn clear_buffer(&self) -> u32 {
        let mut buffer = self.buffer.lock().expect("stream buffer lock poisoned");
        let unacked = buffer.bytes;
        buffer.messages.clear();
        buffer.bytes = 0;
        unacked
    }

    /// Accept one inbound message. `Consumed` means it was applied here and
    /// the caller credits its bytes now; `Buffered` means the processor
    /// task owns the credit.
    pub(crate) fn message_received(&self, msg: DcpMessage) -> EngineResult<Received> {
        let mut buffer = self.buffer.lock().expect("stream buffer lock poisoned");

        if self.state() == StreamState::Dead {
            return Err(DcpError::NoStream);
        }

        match &msg {
            DcpMessage::Mutation { payload, .. } => {
                let by_seqno = payload.by_seqno;
                let last = self.last_seqno.load(Ordering::Relaxed);
                if by_seqno <= last {
                    tracing::warn!(
                        target: "dcp",
                        vbid = %self.vbid,
                        opaque = self.opaque,
                        by_seqno,
                        last_seqno = last,
                        "out of sequence mutation received; dropping"
                    );
                    return Err(DcpError::Range);
                }
                self.last_seqno.store(by_seqno, Ordering::Relaxed);
            }
            DcpMessage::SnapshotMarker {
                start_seqno,
                end_seqno,
                ..
            } => {
                let last = self.last_seqno.load(Ordering::Relaxed);
                if *start_seqno < last && *end_seqno <= last {
                    tracing::warn!(
                        target: "dcp",
                        vbid = %self.vbid,
                        opaque = self.opaque,
                        snap_start = start_seqno,
                        snap_end = end_seqno,
                        last_seqno = last,
                        "stale snapshot marker received; dropping"
                    );
                    return Err(DcpError::Range);
                }
            }
            DcpMessage::SetVBucketState { .. } | DcpMessage::StreamEnd { .. } => {}
            other => {
                tracing::warn!(
                    target: "dcp",
                    vbid = %self.vbid,
                    kind = other.kind_name(),
                    "unexpected message kind on inbound path; disconnecting"
                );
                return Err(DcpError::Disconnect);
            }
        }

        if self.engine.should_process() && buffer.messages.is_empty() {
            match self.process_one(&msg) {
                Ok(()) => return Ok(Received::Consumed),
                Err(ApplyError::Retry) => {}
                Err(ApplyError::Range) => return Err(DcpError::Range),
                Err(ApplyError::NotMyVbucket) => return Err(DcpError::NotMyVbucket),
            }
        }

        buffer.bytes += msg.message_size();
        buffer.messages.push_back(msg);
        Ok(Received::Buffered)
    }

    /// Drain up to one batch of buffered messages. Returns the aggregate
    /// outcome and the byte total to credit to flow control.
    pub(crate) fn process_buffered_messages(&self) -> (ProcessResult, u32) {
        let mut buffer = self.buffer.lock().expect("stream buffer lock poisoned");

        if buffer.messages.is_empty() {
            return (ProcessResult::AllProcessed, 0);
        }

        let mut count = 0usize;
        let mut total_bytes = 0u32;
        let mut failed = false;

        while count < self.batch_size {
            let (message_bytes, result) = {
                let Some(msg) = buffer.messages.front() else {
                    break;
                };
                (msg.message_size(), self.process_one(msg))
            };

            match result {
                Err(ApplyError::Retry) => {
                    failed = true;
                    break;
                }
                Err(ApplyError::Range) => {
                    // Dropped: the bytes were already freed by the inbound
                    // path's accounting rules, so they are not re-credited.
                    buffer.messages.pop_front();
                    buffer.bytes -= message_bytes;
                    count += 1;
                }
                Ok(()) | Err(ApplyError::NotMyVbucket) => {
                    buffer.messages.pop_front();
                    buffer.bytes -= message_bytes;
                    count += 1;
                    total_bytes += message_bytes;
                }
            }
        }

        let outcome = if failed {
            ProcessResult::CannotProcess
        } else {
            ProcessResult::AllProcessed
        };
        (outcome, total_bytes)
    }

    fn process_one(&self, msg: &DcpMessage) -> Result<(), ApplyError> {
        match msg {
            DcpMessage::Mutation { kind, payload, .. } => match kind {
                MutationKind::Mutation => self.process_mutation(payload),
                MutationKind::Deletion | MutationKind::Expiration => {
                    self.process_deletion(payload)
                }
            },
            DcpMessage::SnapshotMarker {
                start_seqno,
                end_seqno,
                flags,
                ..
            } => {
                self.process_marker(*start_seqno, *end_seqno, *flags);
                Ok(())
            }
            DcpMessage::SetVBucketState { state, .. } => {
                self.process_set_vbucket_state(*state);
                Ok(())
            }
            DcpMessage::StreamEnd { opaque, reason, .. } => {
                self.process_stream_end(*opaque, *reason);
                Ok(())
            }
            other => unreachable!("outbound message {} on inbound buffer", other.kind_name()),
        }
    }

    fn process_mutation(&self, payload: &MutationPayload) -> Result<(), ApplyError> {
        let Some(vb) = self.engine.get_vbucket(self.vbid) else {
            return Err(ApplyError::NotMyVbucket);
        };

        let by_seqno = payload.by_seqno;
        if by_seqno < self.cur_snapshot_start.load(Ordering::Relaxed)
            || by_seqno > self.cur_snapshot_end.load(Ordering::Relaxed)
        {
            tracing::warn!(
                target: "dcp",
                vbid = %self.vbid,
                by_seqno,
                snap_start = self.cur_snapshot_start.load(Ordering::Relaxed),
                snap_end = self.cur_snapshot_end.load(Ordering::Relaxed),
                "mutation outside the expected snapshot range; dropping"
            );
            return Err(ApplyError::Range);
        }

        let ret = if vb.is_backfill_phase() {
            self.engine.add_backfill_item(self.vbid, payload)
        } else {
            self.engine.set_with_meta(self.vbid, payload)
        };

        match ret {
            Ok(()) => {
                self.handle_snapshot_end(&vb, by_seqno);
                Ok(())
            }
            Err(StoreError::TmpFail) | Err(StoreError::Oom) => Err(ApplyError::Retry),
            Err(StoreError::NotMyVbucket) => Err(ApplyError::NotMyVbucket),
            Err(err) => {
                tracing::warn!(
                    target: "dcp",
                    vbid = %self.vbid,
                    error = %err,
                    "storage error while applying mutation"
                );
                Ok(())
            }
        }
    }

    fn process_deletion(&self, payload: &MutationPayload) -> Result<(), ApplyError> {
        let Some(vb) = self.engine.get_vbucket(self.vbid) else {
            return Err(ApplyError::NotMyVbucket);
        };

        let by_seqno = payload.by_seqno;
        if by_seqno < self.cur_snapshot_start.load(Ordering::Relaxed)
            || by_seqno > self.cur_snapshot_end.load(Ordering::Relaxed)
        {
            tracing::warn!(
                target: "dcp",
                vbid = %self.vbid,
                by_seqno,
                snap_start = self.cur_snapshot_start.load(Ordering::Relaxed),
                snap_end = self.cur_snapshot_end.load(Ordering::Relaxed),
                "deletion outside the expected snapshot range; dropping"
            );
            return Err(ApplyError::Range);
        }

        match self.engine.delete_with_meta(self.vbid, payload) {
            // A delete for a key we never saw still advances the stream.
            Ok(()) | Err(StoreError::KeyEnoent) => {
                self.handle_snapshot_end(&vb, by_seqno);
                Ok(())
            }
            Err(StoreError::TmpFail) | Err(StoreError::Oom) => Err(ApplyError::Retry),
            Err(StoreError::NotMyVbucket) => Err(ApplyError::NotMyVbucket),
            Err(err) => {
                tracing::warn!(
                    target: "dcp",
                    vbid = %self.vbid,
                    error = %err,
                    "storage error while applying deletion"
                );
                Ok(())
            }
        }
    }

    fn process_marker(&self, start_seqno: u64, end_seqno: u64, flags: MarkerFlags) {
        self.cur_snapshot_start.store(start_seqno, Ordering::Relaxed);
        self.cur_snapshot_end.store(end_seqno, Ordering::Relaxed);
        let snapshot_type = if flags.has(MarkerFlags::DISK) {
            SnapshotType::Disk
        } else {
            SnapshotType::Memory
        };
        self.cur_snapshot_type
            .store(snapshot_type.as_u8(), Ordering::Relaxed);

        if let Some(vb) = self.engine.get_vbucket(self.vbid) {
            if flags.has(MarkerFlags::DISK) && vb.high_seqno() == 0 {
                vb.set_backfill_phase(true);
            } else {
                if flags.has(MarkerFlags::CHK) {
                    vb.create_snapshot(start_seqno, end_seqno);
                } else {
                    vb.update_snapshot_end(end_seqno);
                }
                vb.set_backfill_phase(false);
            }

            if flags.has(MarkerFlags::ACK) {
                self.cur_snapshot_ack.store(true, Ordering::Relaxed);
            }
        }
    }

    fn process_set_vbucket_state(&self, state: crate::message::VBucketState) {
        if let Err(err) = self.engine.set_vbucket_state(self.vbid, state) {
            tracing::warn!(
                target: "dcp",
                vbid = %self.vbid,
                state = state.as_str(),
                error = %err,
                "failed to apply vbucket state change"
            );
        }
        self.push_ready_response(DcpMessage::SetVBucketStateResponse {
            opaque: self.opaque,
            status: ResponseStatus::SUCCESS,
        });
    }

    fn process_stream_end(&self, opaque: u32, reason: StreamEndReason) {
        tracing::info!(
            target: "dcp",
            vbid = %self.vbid,
            reason = reason.describe(),
            "end stream received"
        );

        let reconnected = self
            .consumer
            .upgrade()
            .map(|consumer| consumer.reconnect_slow_stream(self.vbid, opaque, reason))
            .unwrap_or(false);
        if !reconnected {
            self.transition_state(StreamState::Dead);
            metrics::stream_dead();
        }
    }

    fn handle_snapshot_end(&self, vb: &VBucket, by_seqno: u64) {
        if by_seqno != self.cur_snapshot_end.load(Ordering::Relaxed) {
            return;
        }

        if self.snapshot_type() == SnapshotType::Disk && vb.is_backfill_phase() {
            vb.set_backfill_phase(false);
        }

        if self.cur_snapshot_ack.swap(false, Ordering::Relaxed) {
            self.push_ready_response(DcpMessage::SnapshotMarkerResponse {
                opaque: self.opaque,
                status: ResponseStatus::SUCCESS,
            });
        }
        self.cur_snapshot_type
            .store(SnapshotType::None.as_u8(), Ordering::Relaxed);
    }

    /// Pop one outbound response, or mark the stream not-ready.
    pub(crate) fn next(&self) -> Option<DcpMessage> {
        let mut ready = self.ready.lock().expect("ready queue lock poisoned");
        match ready.queue.pop_front() {
            Some(msg) => {
                ready.bytes = ready.bytes.saturating_sub(u64::from(msg.message_size()));
                Some(msg)
            }
            None => {
                self.items_ready.store(false, Ordering::Release);
                None
            }
        }
    }

    pub fn buffered_items(&self) -> usize {
        self.buffer
            .lock()
            .expect("stream buffer lock poisoned")
            .messages
            .len()
    }

    pub fn buffered_bytes(&self) -> u32 {
        self.buffer
            .lock()
            .expect("stream buffer lock poisoned")
            .bytes
    }

    pub fn stats(&self) -> StreamStats {
        let (buffer_items, buffer_bytes) = {
            let buffer = self.buffer.lock().expect("stream buffer lock poisoned");
            (buffer.messages.len(), buffer.bytes)
        };
        let ready_queue_bytes = self.ready.lock().expect("ready queue lock poisoned").bytes;
        StreamStats {
            vbid: self.vbid,
            opaque: self.opaque,
            flags: self.flags,
            state: self.state().as_str(),
            start_seqno: self.start_seqno.load(Ordering::Relaxed),
            end_seqno: self.end_seqno,
            vb_uuid: self.vb_uuid.load(Ordering::Relaxed),
            snap_start_seqno: self.snap_start_seqno.load(Ordering::Relaxed),
            snap_end_seqno: self.snap_end_seqno.load(Ordering::Relaxed),
            last_seqno: self.last_seqno(),
            buffer_items,
            buffer_bytes,
            ready_queue_bytes,
            items_ready: self.items_ready.load(Ordering::Acquire),
            cur_snapshot_type: self.snapshot_type().as_str(),
            cur_snapshot_start: self.cur_snapshot_start.load(Ordering::Relaxed),
            cur_snapshot_end: self.cur_snapshot_end.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RollbackStatus, SnapshotPriority};
    use crate::message::VBucketState;
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;

    struct TestEngine {
        vb: Arc<VBucket>,
        throttle_open: AtomicBool,
        tmpfail_applies: AtomicBool,
        applied: Mutex<Vec<u64>>,
        deleted: Mutex<Vec<u64>>,
        states: Mutex<Vec<VBucketState>>,
    }

    impl TestEngine {
        fn new(vbid: Vbid) -> Arc<Self> {
            Arc::new(Self {
                vb: Arc::new(VBucket::new(vbid, VBucketState::Replica, 0xfeed)),
                throttle_open: AtomicBool::new(true),
                tmpfail_applies: AtomicBool::new(false),
                applied: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
                states: Mutex::new(Vec::new()),
            })
        }
    }

    impl EngineBridge for TestEngine {
        fn get_vbucket(&self, vbid: Vbid) -> Option<Arc<VBucket>> {
            (vbid == self.vb.vbid()).then(|| Arc::clone(&self.vb))
        }

        fn set_with_meta(
            &self,
            _vbid: Vbid,
            mutation: &MutationPayload,
        ) -> Result<(), StoreError> {
            if self.tmpfail_applies.load(Ordering::SeqCst) {
                return Err(StoreError::TmpFail);
            }
            self.applied.lock().unwrap().push(mutation.by_seqno);
            Ok(())
        }

        fn delete_with_meta(
            &self,
            _vbid: Vbid,
            deletion: &MutationPayload,
        ) -> Result<(), StoreError> {
            self.deleted.lock().unwrap().push(deletion.by_seqno);
            Err(StoreError::KeyEnoent)
        }

        fn add_backfill_item(
            &self,
            vbid: Vbid,
            mutation: &MutationPayload,
        ) -> Result<(), StoreError> {
            self.set_with_meta(vbid, mutation)
        }

        fn set_vbucket_state(
            &self,
            _vbid: Vbid,
            state: VBucketState,
        ) -> Result<(), StoreError> {
            self.states.lock().unwrap().push(state);
            Ok(())
        }

        fn rollback(&self, _vbid: Vbid, _seqno: u64) -> RollbackStatus {
            RollbackStatus::Success
        }

        fn schedule_vb_snapshot(&self, _priority: SnapshotPriority, _vbid: Vbid) {}

        fn should_process(&self) -> bool {
            self.throttle_open.load(Ordering::SeqCst)
        }
    }

    fn stream(engine: &Arc<TestEngine>) -> Arc<PassiveStream> {
        PassiveStream::new(
            Weak::new(),
            Arc::<TestEngine>::clone(engine) as Arc<dyn EngineBridge>,
            "replication:test".to_string(),
            0,
            1,
            Vbid::new(0),
            0,
            u64::MAX,
            0xfeed,
            0,
            0,
            0,
            10,
        )
    }

    fn mutation(seqno: u64) -> DcpMessage {
        DcpMessage::Mutation {
            opaque: 1,
            vbid: Vbid::new(0),
            kind: MutationKind::Mutation,
            payload: MutationPayload {
                key: Bytes::from_static(b"key"),
                value: Bytes::from_static(b"value"),
                cas: 1,
                flags: 0,
                datatype: 0,
                locktime: 0,
                by_seqno: seqno,
                rev_seqno: 1,
                exptime: 0,
                nru: 0,
                meta: None,
            },
        }
    }

    fn marker(start: u64, end: u64, flags: u32) -> DcpMessage {
        DcpMessage::SnapshotMarker {
            opaque: 1,
            vbid: Vbid::new(0),
            start_seqno: start,
            end_seqno: end,
            flags: MarkerFlags(flags),
        }
    }

    #[test]
    fn new_stream_is_pending_with_queued_request() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        assert_eq!(stream.state(), StreamState::Pending);
        assert!(matches!(
            stream.next(),
            Some(DcpMessage::StreamRequest { opaque: 1, .. })
        ));
        assert!(stream.next().is_none());
    }

    #[test]
    fn accept_stream_moves_to_reading_and_queues_response() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.next();

        stream.accept_stream(ResponseStatus::SUCCESS, 42);
        assert_eq!(stream.state(), StreamState::Reading);
        assert!(matches!(
            stream.next(),
            Some(DcpMessage::AddStreamResponse {
                external_opaque: 42,
                stream_opaque: 1,
                ..
            })
        ));
    }

    #[test]
    fn rejected_stream_goes_dead() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus(0x0b), 42);
        assert_eq!(stream.state(), StreamState::Dead);
    }

    #[test]
    fn in_window_mutation_applies_synchronously() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);

        assert!(matches!(
            stream.message_received(marker(1, 2, MarkerFlags::MEMORY)),
            Ok(Received::Consumed)
        ));
        assert!(matches!(
            stream.message_received(mutation(1)),
            Ok(Received::Consumed)
        ));
        assert_eq!(*engine.applied.lock().unwrap(), vec![1]);
        assert_eq!(stream.last_seqno(), 1);
    }

    #[test]
    fn throttled_messages_buffer_and_drain() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);

        engine.throttle_open.store(false, Ordering::SeqCst);
        assert!(matches!(
            stream.message_received(marker(1, 2, MarkerFlags::MEMORY)),
            Ok(Received::Buffered)
        ));
        assert!(matches!(
            stream.message_received(mutation(1)),
            Ok(Received::Buffered)
        ));
        assert_eq!(stream.buffered_items(), 2);
        let expected_bytes = marker(1, 2, MarkerFlags::MEMORY).message_size()
            + mutation(1).message_size();
        assert_eq!(stream.buffered_bytes(), expected_bytes);

        engine.throttle_open.store(true, Ordering::SeqCst);
        let (outcome, bytes) = stream.process_buffered_messages();
        assert_eq!(outcome, ProcessResult::AllProcessed);
        assert_eq!(bytes, expected_bytes);
        assert_eq!(stream.buffered_items(), 0);
        assert_eq!(*engine.applied.lock().unwrap(), vec![1]);
    }

    #[test]
    fn tmpfail_apply_leaves_message_buffered() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);

        stream
            .message_received(marker(1, 2, MarkerFlags::MEMORY))
            .unwrap();
        engine.tmpfail_applies.store(true, Ordering::SeqCst);
        assert!(matches!(
            stream.message_received(mutation(1)),
            Ok(Received::Buffered)
        ));

        let (outcome, bytes) = stream.process_buffered_messages();
        assert_eq!(outcome, ProcessResult::CannotProcess);
        assert_eq!(bytes, 0);
        assert_eq!(stream.buffered_items(), 1);

        engine.tmpfail_applies.store(false, Ordering::SeqCst);
        let (outcome, bytes) = stream.process_buffered_messages();
        assert_eq!(outcome, ProcessResult::AllProcessed);
        assert_eq!(bytes, mutation(1).message_size());
    }

    #[test]
    fn out_of_sequence_mutation_is_dropped() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);

        stream
            .message_received(marker(1, 5, MarkerFlags::MEMORY))
            .unwrap();
        stream.message_received(mutation(3)).unwrap();
        assert_eq!(stream.message_received(mutation(3)), Err(DcpError::Range));
        assert_eq!(stream.message_received(mutation(2)), Err(DcpError::Range));
        assert_eq!(*engine.applied.lock().unwrap(), vec![3]);
    }

    #[test]
    fn mutation_outside_snapshot_window_is_dropped() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);

        stream
            .message_received(marker(1, 2, MarkerFlags::MEMORY))
            .unwrap();
        assert_eq!(stream.message_received(mutation(9)), Err(DcpError::Range));
        assert!(engine.applied.lock().unwrap().is_empty());
    }

    #[test]
    fn deletion_for_missing_key_counts_as_applied() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);

        stream
            .message_received(marker(1, 1, MarkerFlags::MEMORY))
            .unwrap();
        let deletion = DcpMessage::Mutation {
            opaque: 1,
            vbid: Vbid::new(0),
            kind: MutationKind::Deletion,
            payload: MutationPayload {
                key: Bytes::from_static(b"gone"),
                value: Bytes::new(),
                cas: 1,
                flags: 0,
                datatype: 0,
                locktime: 0,
                by_seqno: 1,
                rev_seqno: 2,
                exptime: 0,
                nru: 0,
                meta: None,
            },
        };
        assert!(matches!(
            stream.message_received(deletion),
            Ok(Received::Consumed)
        ));
        assert_eq!(*engine.deleted.lock().unwrap(), vec![1]);
    }

    #[test]
    fn acked_snapshot_queues_marker_response_at_snap_end() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);
        stream.next();
        stream.next();

        stream
            .message_received(marker(1, 2, MarkerFlags::MEMORY | MarkerFlags::ACK))
            .unwrap();
        stream.message_received(mutation(1)).unwrap();
        assert!(stream.next().is_none());

        stream.message_received(mutation(2)).unwrap();
        assert!(matches!(
            stream.next(),
            Some(DcpMessage::SnapshotMarkerResponse { .. })
        ));
    }

    #[test]
    fn disk_marker_on_empty_partition_enters_backfill() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);

        stream
            .message_received(marker(1, 4, MarkerFlags::DISK))
            .unwrap();
        assert!(engine.vb.is_backfill_phase());

        // The mutation closing the snapshot leaves backfill phase.
        stream.message_received(mutation(1)).unwrap();
        assert!(engine.vb.is_backfill_phase());
        stream.message_received(mutation(4)).unwrap();
        assert!(!engine.vb.is_backfill_phase());
    }

    #[test]
    fn set_vbucket_state_applies_and_queues_response() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);
        stream.next();
        stream.next();

        let msg = DcpMessage::SetVBucketState {
            opaque: 1,
            vbid: Vbid::new(0),
            state: VBucketState::Active,
        };
        assert!(matches!(
            stream.message_received(msg),
            Ok(Received::Consumed)
        ));
        assert_eq!(*engine.states.lock().unwrap(), vec![VBucketState::Active]);
        assert!(matches!(
            stream.next(),
            Some(DcpMessage::SetVBucketStateResponse { .. })
        ));
    }

    #[test]
    fn stream_end_without_reconnect_goes_dead() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);

        let msg = DcpMessage::StreamEnd {
            opaque: 1,
            vbid: Vbid::new(0),
            reason: StreamEndReason::Ok,
        };
        assert!(matches!(
            stream.message_received(msg),
            Ok(Received::Consumed)
        ));
        assert_eq!(stream.state(), StreamState::Dead);
    }

    #[test]
    fn dead_stream_rejects_input_and_returns_unacked_bytes() {
        let engine = TestEngine::new(Vbid::new(0));
        let stream = stream(&engine);
        stream.accept_stream(ResponseStatus::SUCCESS, 42);

        engine.throttle_open.store(false, Ordering::SeqCst);
        stream
            .message_received(marker(1, 2, MarkerFlags::MEMORY))
            .unwrap();
        let buffered = stream.buffered_bytes();
        assert!(buffered > 0);

        let unacked = stream.set_dead(StreamEndReason::Closed);
        assert_eq!(unacked, buffered);
        assert_eq!(stream.buffered_bytes(), 0);
        assert_eq!(
            stream.message_received(mutation(1)),
            Err(DcpError::NoStream)
        );
    }
}
