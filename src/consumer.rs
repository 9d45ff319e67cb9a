//! The DCP consumer connection.
//!
//! One instance per inbound replication connection. The host wire layer
//! drives it from the network thread: inbound protocol calls land in the
//! per-partition streams, `step` pumps outbound messages, and
//! `handle_response` correlates producer answers back to the stream that
//! asked. A processor task drains buffered messages off-thread; rollbacks
//! run on the writer pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::Config;
use crate::control::{ControlNegotiator, NoopMonitor};
use crate::engine::{
    ConnectionNotifier, EngineBridge, HostAllocScope, MemoryTracker, SnapshotPriority,
};
use crate::error::{DcpError, EngineResult, ProcessResult, Received, StepOutcome};
use crate::executor::{TaskId, TaskPools};
use crate::flow_control::FlowControl;
use crate::message::{
    DcpMessage, MarkerFlags, MutationKind, MutationPayload, StreamEndReason, VBucketState, Vbid,
};
use crate::opaque::{OpaqueCounter, OpaqueRegistry};
use crate::processor::{ProcessorTask, RollbackTask};
use crate::producers::MessageProducers;
use crate::stream::{PassiveStream, StreamState, StreamStats};
use crate::wire::{self, ProducerResponse, ResponseOpcode, ResponseStatus, FAILOVER_ENTRY_BYTES};

/// External collaborators a consumer is wired to at creation.
#[derive(Clone)]
pub struct ConsumerHandles {
    pub engine: Arc<dyn EngineBridge>,
    pub notifier: Arc<dyn ConnectionNotifier>,
    pub memory: Arc<dyn MemoryTracker>,
    pub pools: Arc<TaskPools>,
}

/// Point-in-time consumer stats.
#[derive(Debug, Clone)]
pub struct ConsumerStats {
    pub name: String,
    pub backoffs: u64,
    pub rollbacks: u64,
    pub paused: bool,
    pub flow_buffer_bytes: u32,
    pub flow_freed_bytes: u32,
    pub since_last_noop: Duration,
    pub streams: Vec<StreamStats>,
}

pub struct DcpConsumer {
    name: String,
    config: Config,
    engine: Arc<dyn EngineBridge>,
    notifier: Arc<dyn ConnectionNotifier>,
    memory: Arc<dyn MemoryTracker>,
    pools: Arc<TaskPools>,
    streams: Vec<RwLock<Option<Arc<PassiveStream>>>>,
    opaques: OpaqueCounter,
    registry: OpaqueRegistry,
    ready: Mutex<VecDeque<Vbid>>,
    flow_control: FlowControl,
    negotiator: ControlNegotiator,
    noop: NoopMonitor,
    items_to_process: AtomicBool,
    disconnect: AtomicBool,
    paused: AtomicBool,
    backoffs: AtomicU64,
    rollbacks: AtomicU64,
    task_cancelled: AtomicBool,
    processor_task: OnceLock<TaskId>,
    last_walk: Mutex<Instant>,
    self_ref: Weak<DcpConsumer>,
}

impl DcpConsumer {
    pub fn new(name: impl Into<String>, config: &Config, handles: ConsumerHandles) -> Arc<Self> {
        let name = name.into();
        let config = config.clone();
        let streams = (0..config.max_vbuckets)
            .map(|_| RwLock::new(None))
            .collect();

        let consumer = Arc::new_cyclic(|self_ref| Self {
            flow_control: FlowControl::new(
                config.flow_control_buf_bytes,
                config.flow_control_ack_ratio,
            ),
            negotiator: ControlNegotiator::new(&config),
            noop: NoopMonitor::new(&config),
            name,
            config,
            engine: handles.engine,
            notifier: handles.notifier,
            memory: handles.memory,
            pools: handles.pools,
            streams,
            opaques: OpaqueCounter::new(),
            registry: OpaqueRegistry::new(),
            ready: Mutex::new(VecDeque::new()),
            items_to_process: AtomicBool::new(false),
            disconnect: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            backoffs: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            task_cancelled: AtomicBool::new(false),
            processor_task: OnceLock::new(),
            last_walk: Mutex::new(Instant::now()),
            self_ref: self_ref.clone(),
        });

        let task = Arc::new(ProcessorTask::new(Arc::downgrade(&consumer)));
        let id = consumer.pools.nonio.schedule(task, Duration::from_secs(1));
        let _ = consumer.processor_task.set(id);

        consumer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Sticky disconnect flag; once set every call short-circuits.
    pub fn pending_disconnect(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    /// Flag the connection for teardown.
    pub fn set_pending_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    fn check_disconnect(&self) -> EngineResult {
        if self.pending_disconnect() {
            Err(DcpError::Disconnect)
        } else {
            Ok(())
        }
    }

    /// Cancel the processor and tear every stream down. Idempotent; also
    /// runs on drop.
    pub fn shutdown(&self) {
        self.cancel_task();
        self.close_all_streams();
    }

    fn cancel_task(&self) {
        if self
            .task_cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(id) = self.processor_task.get() {
                self.pools.nonio.cancel(*id);
            }
        }
    }

    /// Called by the retiring processor task; whichever of the task and the
    /// consumer loses the compare-and-set does nothing.
    pub(crate) fn mark_task_cancelled(&self) {
        let _ = self
            .task_cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire);
    }

    fn close_all_streams(&self) {
        for slot in &self.streams {
            let stream = slot.read().expect("streams lock poisoned").clone();
            if let Some(stream) = stream {
                stream.set_dead(StreamEndReason::Disconnected);
            }
        }
    }

    fn stream_at(&self, vbid: Vbid) -> Option<Arc<PassiveStream>> {
        self.streams
            .get(vbid.index())?
            .read()
            .expect("streams lock poisoned")
            .clone()
    }

    fn active_stream_matching(&self, vbid: Vbid, opaque: u32) -> Option<Arc<PassiveStream>> {
        self.stream_at(vbid)
            .filter(|stream| stream.opaque() == opaque && stream.is_active())
    }

    pub fn is_stream_present(&self, vbid: Vbid) -> bool {
        self.stream_at(vbid).is_some_and(|stream| stream.is_active())
    }

    pub(crate) fn is_valid_opaque(&self, opaque: u32, vbid: Vbid) -> bool {
        self.stream_at(vbid)
            .is_some_and(|stream| stream.opaque() == opaque)
    }

    // ---- inbound protocol operations -----------------------------------

    pub fn add_stream(&self, opaque: u32, vbid: Vbid, flags: u32) -> EngineResult {
        let mut ready = self.ready.lock().expect("ready list lock poisoned");
        self.check_disconnect()?;

        let Some(vb) = self.engine.get_vbucket(vbid) else {
            tracing::warn!(
                target: "dcp",
                name = %self.name,
                vbid = %vbid,
                "add stream failed: vbucket does not exist"
            );
            return Err(DcpError::NotMyVbucket);
        };

        if vb.state() == VBucketState::Active {
            tracing::warn!(
                target: "dcp",
                name = %self.name,
                vbid = %vbid,
                "add stream failed: vbucket is in active state"
            );
            return Err(DcpError::NotMyVbucket);
        }

        let Some(slot) = self.streams.get(vbid.index()) else {
            return Err(DcpError::NotMyVbucket);
        };

        let mut info = vb.snapshot_info();
        if info.range.end == info.start {
            info.range.start = info.start;
        }

        let new_opaque = self.opaques.next();
        let entry = vb.latest_failover_entry();
        let start_seqno = info.start;
        let end_seqno = u64::MAX;
        let snap_start_seqno = info.range.start;
        let snap_end_seqno = info.range.end;
        let high_seqno = vb.high_seqno();

        {
            let current = slot.read().expect("streams lock poisoned");
            if let Some(stream) = current.as_ref() {
                if stream.is_active() {
                    tracing::warn!(
                        target: "dcp",
                        name = %self.name,
                        vbid = %vbid,
                        "cannot add stream: one already exists"
                    );
                    return Err(DcpError::StreamExists);
                }
            }
        }

        let stream = PassiveStream::new(
            self.self_ref.clone(),
            Arc::clone(&self.engine),
            self.name.clone(),
            flags,
            new_opaque,
            vbid,
            start_seqno,
            end_seqno,
            entry.uuid,
            snap_start_seqno,
            snap_end_seqno,
            high_seqno,
            self.config.processor_batch_size,
        );
        *slot.write().expect("streams lock poisoned") = Some(stream);

        if !ready.contains(&vbid) {
            ready.push_back(vbid);
        }
        self.registry.insert(new_opaque, opaque, vbid);

        Ok(())
    }

    pub fn close_stream(&self, opaque: u32, vbid: Vbid) -> EngineResult {
        self.check_disconnect()?;

        self.registry.remove(opaque);

        let Some(stream) = self.stream_at(vbid) else {
            tracing::warn!(
                target: "dcp",
                name = %self.name,
                vbid = %vbid,
                "cannot close stream: none exists for this vbucket"
            );
            return Err(DcpError::NoStream);
        };

        let cleared = stream.set_dead(StreamEndReason::Closed);
        self.flow_control.incr_freed_bytes(cleared);
        Ok(())
    }

    pub fn stream_end(&self, opaque: u32, vbid: Vbid, reason: StreamEndReason) -> EngineResult {
        self.check_disconnect()?;
        self.deliver(
            opaque,
            vbid,
            DcpMessage::StreamEnd {
                opaque,
                vbid,
                reason,
            },
        )
    }

    pub fn mutation(&self, opaque: u32, vbid: Vbid, payload: MutationPayload) -> EngineResult {
        self.check_disconnect()?;

        if payload.by_seqno == 0 {
            tracing::warn!(
                target: "dcp",
                name = %self.name,
                vbid = %vbid,
                "invalid sequence number (0) for mutation"
            );
            return Err(DcpError::Invalid("zero sequence number for mutation"));
        }

        self.deliver(
            opaque,
            vbid,
            DcpMessage::Mutation {
                opaque,
                vbid,
                kind: MutationKind::Mutation,
                payload,
            },
        )
    }

    pub fn deletion(&self, opaque: u32, vbid: Vbid, payload: MutationPayload) -> EngineResult {
        self.check_disconnect()?;

        if payload.by_seqno == 0 {
            tracing::warn!(
                target: "dcp",
                name = %self.name,
                vbid = %vbid,
                "invalid sequence number (0) for deletion"
            );
            return Err(DcpError::Invalid("zero sequence number for deletion"));
        }

        // Deletions carry no value regardless of what the host handed over.
        let payload = MutationPayload {
            value: Bytes::new(),
            ..payload
        };
        self.deliver(
            opaque,
            vbid,
            DcpMessage::Mutation {
                opaque,
                vbid,
                kind: MutationKind::Deletion,
                payload,
            },
        )
    }

    pub fn expiration(&self, opaque: u32, vbid: Vbid, payload: MutationPayload) -> EngineResult {
        self.deletion(opaque, vbid, payload)
    }

    pub fn snapshot_marker(
        &self,
        opaque: u32,
        vbid: Vbid,
        start_seqno: u64,
        end_seqno: u64,
        flags: MarkerFlags,
    ) -> EngineResult {
        self.check_disconnect()?;

        if start_seqno > end_seqno {
            tracing::warn!(
                target: "dcp",
                name = %self.name,
                vbid = %vbid,
                start_seqno,
                end_seqno,
                "invalid snapshot marker: expected snap_start <= snap_end"
            );
            return Err(DcpError::Invalid("snapshot marker start exceeds end"));
        }

        self.deliver(
            opaque,
            vbid,
            DcpMessage::SnapshotMarker {
                opaque,
                vbid,
                start_seqno,
                end_seqno,
                flags,
            },
        )
    }

    pub fn set_vbucket_state(
        &self,
        opaque: u32,
        vbid: Vbid,
        state: VBucketState,
    ) -> EngineResult {
        self.check_disconnect()?;
        self.deliver(
            opaque,
            vbid,
            DcpMessage::SetVBucketState {
                opaque,
                vbid,
                state,
            },
        )
    }

    pub fn noop(&self, _opaque: u32) -> EngineResult {
        self.check_disconnect()?;
        self.noop.on_noop();
        Ok(())
    }

    pub fn flush(&self, _opaque: u32, _vbid: Vbid) -> EngineResult {
        self.check_disconnect()?;
        Err(DcpError::NotSupported)
    }

    /// Deliver an inbound message to its stream and settle the byte
    /// accounting: consumed or failed messages are credited here, buffered
    /// ones when the processor drains them.
    fn deliver(&self, opaque: u32, vbid: Vbid, msg: DcpMessage) -> EngineResult {
        let bytes = msg.message_size();
        let result = match self.active_stream_matching(vbid, opaque) {
            Some(stream) => stream.message_received(msg),
            None => Err(DcpError::NoStream),
        };

        match result {
            Ok(Received::Buffered) => {
                if self
                    .items_to_process
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if let Some(id) = self.processor_task.get() {
                        self.pools.nonio.wake(*id);
                    }
                }
                Ok(())
            }
            Ok(Received::Consumed) => {
                self.flow_control.incr_freed_bytes(bytes);
                Ok(())
            }
            Err(err) => {
                self.flow_control.incr_freed_bytes(bytes);
                if err == DcpError::Disconnect {
                    self.set_pending_disconnect();
                }
                Err(err)
            }
        }
    }

    // ---- outbound pump --------------------------------------------------

    fn lift(&self, ret: EngineResult) -> EngineResult<StepOutcome> {
        match ret {
            Ok(()) => Ok(StepOutcome::WantMore),
            Err(err) => {
                if err == DcpError::Disconnect {
                    self.set_pending_disconnect();
                }
                Err(err)
            }
        }
    }

    /// Ask each outbound source for one message, in fixed order; emit at
    /// most one.
    pub fn step(&self, producers: &mut dyn MessageProducers) -> EngineResult<StepOutcome> {
        *self.last_walk.lock().expect("last walk lock poisoned") = Instant::now();
        self.check_disconnect()?;

        {
            let _scope = HostAllocScope::enter(&*self.memory);
            if let Some(ret) = self.flow_control.handle(&self.opaques, producers) {
                return self.lift(ret);
            }
            if let Some(ret) = self.noop.handle(&self.opaques, producers) {
                return self.lift(ret);
            }
            if let Some(ret) = self.negotiator.handle_priority(&self.opaques, producers) {
                return self.lift(ret);
            }
            if let Some(ret) = self.negotiator.handle_ext_metadata(&self.opaques, producers) {
                return self.lift(ret);
            }
            if let Some(ret) = self
                .negotiator
                .handle_value_compression(&self.opaques, producers)
            {
                return self.lift(ret);
            }
            if let Some(ret) = self
                .negotiator
                .handle_cursor_dropping(&self.opaques, producers)
            {
                return self.lift(ret);
            }
        }

        let Some(resp) = self.next_ready_response() else {
            return Ok(StepOutcome::Idle);
        };

        let ret = {
            let _scope = HostAllocScope::enter(&*self.memory);
            match resp {
                DcpMessage::AddStreamResponse {
                    external_opaque,
                    stream_opaque,
                    status,
                } => producers.add_stream_rsp(external_opaque, stream_opaque, status),
                DcpMessage::StreamRequest {
                    opaque,
                    vbid,
                    flags,
                    start_seqno,
                    end_seqno,
                    vbucket_uuid,
                    snap_start_seqno,
                    snap_end_seqno,
                } => producers.stream_req(
                    opaque,
                    vbid,
                    flags,
                    start_seqno,
                    end_seqno,
                    vbucket_uuid,
                    snap_start_seqno,
                    snap_end_seqno,
                ),
                DcpMessage::SetVBucketStateResponse { opaque, status } => {
                    producers.set_vbucket_state_rsp(opaque, status)
                }
                DcpMessage::SnapshotMarkerResponse { opaque, status } => {
                    producers.marker_rsp(opaque, status)
                }
                other => {
                    tracing::error!(
                        target: "dcp",
                        name = %self.name,
                        kind = other.kind_name(),
                        "unexpected event on the outbound queue; disconnecting"
                    );
                    self.set_pending_disconnect();
                    return Err(DcpError::Disconnect);
                }
            }
        };

        self.lift(ret)
    }

    /// Round-robin drain over the ready list: each stream that yields a
    /// response goes back to the tail.
    fn next_ready_response(&self) -> Option<DcpMessage> {
        let mut ready = self.ready.lock().expect("ready list lock poisoned");

        self.paused.store(false, Ordering::Release);
        while let Some(vbid) = ready.pop_front() {
            let Some(stream) = self.stream_at(vbid) else {
                continue;
            };
            let Some(resp) = stream.next() else {
                continue;
            };
            ready.push_back(vbid);
            return Some(resp);
        }
        self.paused.store(true, Ordering::Release);

        None
    }

    /// A stream has outbound work; queue it (deduplicated) and nudge the
    /// host.
    pub(crate) fn notify_stream_ready(&self, vbid: Vbid) {
        {
            let mut ready = self.ready.lock().expect("ready list lock poisoned");
            if ready.contains(&vbid) {
                return;
            }
            ready.push_back(vbid);
        }
        self.notifier.notify_connection(true);
    }

    // ---- response correlation ------------------------------------------

    pub fn handle_response(&self, resp: &ProducerResponse) -> EngineResult {
        self.check_disconnect()?;

        match resp.opcode {
            ResponseOpcode::StreamRequest => {
                let Some((_, vbid)) = self.registry.get(resp.opaque) else {
                    tracing::warn!(
                        target: "dcp",
                        name = %self.name,
                        opaque = resp.opaque,
                        "received response but that stream no longer exists"
                    );
                    return Err(DcpError::NoStream);
                };
                if !self.is_valid_opaque(resp.opaque, vbid) {
                    tracing::warn!(
                        target: "dcp",
                        name = %self.name,
                        opaque = resp.opaque,
                        vbid = %vbid,
                        "received response but that stream no longer exists"
                    );
                    return Err(DcpError::NoStream);
                }

                if resp.status == ResponseStatus::ROLLBACK {
                    let rollback_seqno = match wire::parse_rollback_seqno(&resp.body) {
                        Ok(seqno) => seqno,
                        Err(err) => {
                            tracing::warn!(
                                target: "dcp",
                                name = %self.name,
                                vbid = %vbid,
                                error = %err,
                                "rollback response with malformed body; disconnecting"
                            );
                            self.set_pending_disconnect();
                            return Err(DcpError::Disconnect);
                        }
                    };

                    tracing::info!(
                        target: "dcp",
                        name = %self.name,
                        vbid = %vbid,
                        rollback_seqno,
                        "received rollback request"
                    );
                    let task = RollbackTask::new(
                        self.self_ref.clone(),
                        resp.opaque,
                        vbid,
                        rollback_seqno,
                    );
                    self.pools.writer.schedule(Arc::new(task), Duration::ZERO);
                    return Ok(());
                }

                if resp.status.is_success()
                    && (resp.body.is_empty() || resp.body.len() % FAILOVER_ENTRY_BYTES != 0)
                {
                    tracing::warn!(
                        target: "dcp",
                        name = %self.name,
                        vbid = %vbid,
                        body_len = resp.body.len(),
                        "stream response with a bad failover log; disconnecting"
                    );
                    self.set_pending_disconnect();
                    return Err(DcpError::Disconnect);
                }

                self.stream_accepted(resp.opaque, resp.status, &resp.body);
                Ok(())
            }
            ResponseOpcode::BufferAcknowledgement | ResponseOpcode::Control => Ok(()),
            ResponseOpcode::Other(opcode) => {
                tracing::warn!(
                    target: "dcp",
                    name = %self.name,
                    opcode,
                    "unknown response opcode; disconnecting"
                );
                self.set_pending_disconnect();
                Err(DcpError::Disconnect)
            }
        }
    }

    fn stream_accepted(&self, opaque: u32, status: ResponseStatus, body: &[u8]) {
        let Some((add_opaque, vbid)) = self.registry.get(opaque) else {
            tracing::warn!(
                target: "dcp",
                name = %self.name,
                opaque,
                "no opaque found for stream response"
            );
            return;
        };

        match self.stream_at(vbid) {
            Some(stream)
                if stream.opaque() == opaque && stream.state() == StreamState::Pending =>
            {
                if status.is_success() {
                    if let Some(vb) = self.engine.get_vbucket(vbid) {
                        if let Err(err) = vb.replace_failover_log(body) {
                            tracing::warn!(
                                target: "dcp",
                                name = %self.name,
                                vbid = %vbid,
                                error = %err,
                                "failed to install failover log"
                            );
                        }
                        self.engine
                            .schedule_vb_snapshot(SnapshotPriority::High, vbid);
                    }
                }
                tracing::info!(
                    target: "dcp",
                    name = %self.name,
                    vbid = %vbid,
                    opaque,
                    accepted = status.is_success(),
                    status = status.0,
                    "stream request answered"
                );
                stream.accept_stream(status, add_opaque);
            }
            _ => {
                tracing::warn!(
                    target: "dcp",
                    name = %self.name,
                    vbid = %vbid,
                    opaque,
                    add_opaque,
                    "trying to accept stream, but none exists"
                );
            }
        }
        self.registry.remove(opaque);
    }

    /// Re-issue the stream request after a producer-mandated rollback.
    /// Returns true to reschedule (storage wants a retry).
    pub(crate) fn do_rollback(&self, opaque: u32, vbid: Vbid, rollback_seqno: u64) -> bool {
        match self.engine.rollback(vbid, rollback_seqno) {
            crate::engine::RollbackStatus::TmpFail => true,
            crate::engine::RollbackStatus::NotMyVbucket => {
                tracing::warn!(
                    target: "dcp",
                    name = %self.name,
                    vbid = %vbid,
                    "rollback failed: vbucket not found"
                );
                false
            }
            crate::engine::RollbackStatus::Success => {
                if let Some(vb) = self.engine.get_vbucket(vbid) {
                    if let Some(stream) = self.stream_at(vbid) {
                        stream.reconnect_stream(&vb, opaque, vb.high_seqno());
                    }
                }
                self.rollbacks.fetch_add(1, Ordering::Relaxed);
                crate::metrics::rollback_completed();
                false
            }
        }
    }

    /// A stream-end arrived; reconnect only when the producer dropped us
    /// for being slow.
    pub(crate) fn reconnect_slow_stream(
        &self,
        vbid: Vbid,
        opaque: u32,
        reason: StreamEndReason,
    ) -> bool {
        if reason != StreamEndReason::Slow {
            return false;
        }
        let Some(vb) = self.engine.get_vbucket(vbid) else {
            return false;
        };
        let Some(stream) = self.stream_at(vbid) else {
            return false;
        };

        tracing::info!(
            target: "dcp",
            name = %self.name,
            vbid = %vbid,
            "reconnecting stream after END_STREAM with reason SLOW"
        );
        stream.reconnect_stream(&vb, opaque, vb.high_seqno());
        true
    }

    // ---- processor body -------------------------------------------------

    /// Drain buffered messages across all streams, crediting flow control
    /// as bytes are processed. Runs on the processor task.
    pub(crate) fn process_buffered_items(&self) -> ProcessResult {
        self.items_to_process.store(false, Ordering::Release);
        let mut process_ret = ProcessResult::AllProcessed;

        for slot in &self.streams {
            let stream = slot.read().expect("streams lock poisoned").clone();
            let Some(stream) = stream else {
                continue;
            };

            loop {
                if !self.engine.should_process() {
                    self.backoffs.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::processor_backoff();
                    return ProcessResult::CannotProcess;
                }

                let (ret, bytes_processed) = stream.process_buffered_messages();
                self.flow_control.incr_freed_bytes(bytes_processed);
                process_ret = ret;
                if bytes_processed == 0 || ret == ProcessResult::CannotProcess {
                    break;
                }
            }
        }

        if self.flow_control.is_sufficiently_drained() {
            // Get the ack out now rather than waiting for the connection
            // manager's next walk.
            self.notifier.notify_connection(false);
        }

        if process_ret == ProcessResult::AllProcessed
            && self.items_to_process.load(Ordering::Acquire)
        {
            return ProcessResult::MoreToProcess;
        }

        process_ret
    }

    // ---- stats ----------------------------------------------------------

    pub fn flow_control(&self) -> &FlowControl {
        &self.flow_control
    }

    pub fn set_flow_buffer_size(&self, new_size: u32) {
        self.flow_control.set_buffer_size(new_size);
    }

    pub fn backoffs(&self) -> u64 {
        self.backoffs.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ConsumerStats {
        let streams = self
            .streams
            .iter()
            .filter_map(|slot| {
                slot.read()
                    .expect("streams lock poisoned")
                    .as_ref()
                    .map(|stream| stream.stats())
            })
            .collect();

        ConsumerStats {
            name: self.name.clone(),
            backoffs: self.backoffs(),
            rollbacks: self.rollbacks(),
            paused: self.is_paused(),
            flow_buffer_bytes: self.flow_control.buffer_size(),
            flow_freed_bytes: self.flow_control.freed_bytes(),
            since_last_noop: self.noop.since_last_noop(),
            streams,
        }
    }
}

impl Drop for DcpConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
