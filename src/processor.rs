//! Background tasks: the buffered-item processor and one-shot rollbacks.
//!
//! Both hold only a weak reference to the consumer; the executor owns the
//! task, and a single-winner compare-and-set on the consumer's cancel flag
//! keeps teardown races benign.

use std::sync::Weak;
use std::time::Duration;

use crate::consumer::DcpConsumer;
use crate::error::ProcessResult;
use crate::executor::{Task, TaskControl};
use crate::message::Vbid;

/// Drains buffered messages across all of a consumer's streams, pacing
/// itself off the aggregate outcome.
pub(crate) struct ProcessorTask {
    consumer: Weak<DcpConsumer>,
}

impl ProcessorTask {
    pub(crate) fn new(consumer: Weak<DcpConsumer>) -> Self {
        Self { consumer }
    }
}

impl Task for ProcessorTask {
    fn run(&self) -> TaskControl {
        let Some(consumer) = self.consumer.upgrade() else {
            return TaskControl::Done;
        };
        if consumer.pending_disconnect() {
            return TaskControl::Done;
        }

        match consumer.process_buffered_items() {
            ProcessResult::AllProcessed => TaskControl::Snooze(Duration::from_secs(1)),
            ProcessResult::MoreToProcess => TaskControl::Snooze(Duration::ZERO),
            ProcessResult::CannotProcess => TaskControl::Snooze(Duration::from_secs(5)),
        }
    }

    fn describe(&self) -> String {
        match self.consumer.upgrade() {
            Some(consumer) => format!("processing buffered items for {}", consumer.name()),
            None => "processing buffered items (consumer gone)".to_string(),
        }
    }
}

impl Drop for ProcessorTask {
    fn drop(&mut self) {
        // The task can outlive the consumer's cancel call or vice versa;
        // whichever side loses the compare-and-set does nothing.
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.mark_task_cancelled();
        }
    }
}

/// Rolls a partition back to a producer-supplied seqno, then re-issues the
/// stream request from the partition's high seqno.
pub(crate) struct RollbackTask {
    consumer: Weak<DcpConsumer>,
    opaque: u32,
    vbid: Vbid,
    rollback_seqno: u64,
}

impl RollbackTask {
    pub(crate) fn new(
        consumer: Weak<DcpConsumer>,
        opaque: u32,
        vbid: Vbid,
        rollback_seqno: u64,
    ) -> Self {
        Self {
            consumer,
            opaque,
            vbid,
            rollback_seqno,
        }
    }
}

impl Task for RollbackTask {
    fn run(&self) -> TaskControl {
        let Some(consumer) = self.consumer.upgrade() else {
            return TaskControl::Done;
        };

        if consumer.do_rollback(self.opaque, self.vbid, self.rollback_seqno) {
            // Storage asked for a retry.
            TaskControl::Snooze(Duration::from_secs(1))
        } else {
            TaskControl::Done
        }
    }

    fn describe(&self) -> String {
        format!(
            "rolling back vb {} to seqno {}",
            self.vbid, self.rollback_seqno
        )
    }
}
