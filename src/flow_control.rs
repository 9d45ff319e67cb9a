//! Windowed flow control for the inbound connection.
//!
//! The consumer declares a receive-buffer size to the producer once, tallies
//! the bytes of every message it has finished processing, and hands the
//! window back with buffer acknowledgements once enough has been freed.
//! Acks are observable only after the bytes they cover were credited.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::EngineResult;
use crate::metrics;
use crate::opaque::OpaqueCounter;
use crate::producers::MessageProducers;

pub const CONNECTION_BUFFER_SIZE_KEY: &str = "connection_buffer_size";

#[derive(Debug)]
pub struct FlowControl {
    buf_size: AtomicU32,
    freed: AtomicU32,
    pending_control: AtomicBool,
    ack_ratio: u32,
}

impl FlowControl {
    pub fn new(buf_size: u32, ack_ratio: u32) -> Self {
        Self {
            buf_size: AtomicU32::new(buf_size),
            freed: AtomicU32::new(0),
            pending_control: AtomicBool::new(true),
            ack_ratio,
        }
    }

    pub fn buffer_size(&self) -> u32 {
        self.buf_size.load(Ordering::Relaxed)
    }

    /// Adjust the declared buffer size; re-announces to the producer on the
    /// next step.
    pub fn set_buffer_size(&self, new_size: u32) {
        self.buf_size.store(new_size, Ordering::Relaxed);
        self.pending_control.store(true, Ordering::Relaxed);
    }

    pub fn incr_freed_bytes(&self, bytes: u32) {
        if bytes > 0 {
            self.freed.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn freed_bytes(&self) -> u32 {
        self.freed.load(Ordering::Relaxed)
    }

    /// True once enough bytes have been freed to warrant an ack.
    pub fn is_sufficiently_drained(&self) -> bool {
        let threshold = self.buffer_size() / self.ack_ratio;
        self.freed.load(Ordering::Relaxed) >= threshold.max(1)
    }

    /// One outbound attempt: the buffer-size announcement first, then an
    /// ack if one is due. `None` means nothing to send.
    pub fn handle(
        &self,
        opaques: &OpaqueCounter,
        producers: &mut dyn MessageProducers,
    ) -> Option<EngineResult> {
        if self
            .pending_control
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let opaque = opaques.next();
            let size = self.buffer_size().to_string();
            return Some(producers.control(opaque, CONNECTION_BUFFER_SIZE_KEY, size.as_bytes()));
        }

        if self.is_sufficiently_drained() {
            let ack_bytes = self.freed.load(Ordering::Acquire);
            let opaque = opaques.next();
            let ret = producers.buffer_ack(opaque, ack_bytes);
            if ret.is_ok() {
                // Subtract exactly what was acked; concurrent credits from
                // the processor thread are preserved.
                self.freed.fetch_sub(ack_bytes, Ordering::AcqRel);
                metrics::buffer_ack_sent(ack_bytes);
            }
            return Some(ret);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DcpError;
    use crate::message::Vbid;
    use crate::wire::ResponseStatus;

    #[derive(Default)]
    struct Sink {
        controls: Vec<(String, String)>,
        acks: Vec<u32>,
        fail_next: bool,
    }

    impl MessageProducers for Sink {
        fn stream_req(
            &mut self,
            _opaque: u32,
            _vbid: Vbid,
            _flags: u32,
            _start_seqno: u64,
            _end_seqno: u64,
            _vbucket_uuid: u64,
            _snap_start_seqno: u64,
            _snap_end_seqno: u64,
        ) -> EngineResult {
            Ok(())
        }

        fn add_stream_rsp(
            &mut self,
            _external_opaque: u32,
            _stream_opaque: u32,
            _status: ResponseStatus,
        ) -> EngineResult {
            Ok(())
        }

        fn set_vbucket_state_rsp(&mut self, _opaque: u32, _status: ResponseStatus) -> EngineResult {
            Ok(())
        }

        fn marker_rsp(&mut self, _opaque: u32, _status: ResponseStatus) -> EngineResult {
            Ok(())
        }

        fn buffer_ack(&mut self, _opaque: u32, buffer_bytes: u32) -> EngineResult {
            if self.fail_next {
                self.fail_next = false;
                return Err(DcpError::Disconnect);
            }
            self.acks.push(buffer_bytes);
            Ok(())
        }

        fn control(&mut self, _opaque: u32, key: &str, value: &[u8]) -> EngineResult {
            self.controls
                .push((key.to_string(), String::from_utf8_lossy(value).into_owned()));
            Ok(())
        }
    }

    #[test]
    fn announces_buffer_size_exactly_once() {
        let flow = FlowControl::new(1000, 5);
        let opaques = OpaqueCounter::new();
        let mut sink = Sink::default();

        assert!(matches!(flow.handle(&opaques, &mut sink), Some(Ok(()))));
        assert_eq!(
            sink.controls,
            vec![("connection_buffer_size".to_string(), "1000".to_string())]
        );
        assert!(flow.handle(&opaques, &mut sink).is_none());
    }

    #[test]
    fn ack_fires_at_threshold_and_resets() {
        let flow = FlowControl::new(1000, 5);
        let opaques = OpaqueCounter::new();
        let mut sink = Sink::default();
        flow.handle(&opaques, &mut sink);

        flow.incr_freed_bytes(199);
        assert!(!flow.is_sufficiently_drained());
        assert!(flow.handle(&opaques, &mut sink).is_none());

        flow.incr_freed_bytes(1);
        assert!(flow.is_sufficiently_drained());
        assert!(matches!(flow.handle(&opaques, &mut sink), Some(Ok(()))));
        assert_eq!(sink.acks, vec![200]);
        assert_eq!(flow.freed_bytes(), 0);
    }

    #[test]
    fn failed_ack_keeps_the_count() {
        let flow = FlowControl::new(1000, 5);
        let opaques = OpaqueCounter::new();
        let mut sink = Sink::default();
        flow.handle(&opaques, &mut sink);

        flow.incr_freed_bytes(500);
        sink.fail_next = true;
        assert!(matches!(
            flow.handle(&opaques, &mut sink),
            Some(Err(DcpError::Disconnect))
        ));
        assert_eq!(flow.freed_bytes(), 500);
    }

    #[test]
    fn resize_reannounces() {
        let flow = FlowControl::new(1000, 5);
        let opaques = OpaqueCounter::new();
        let mut sink = Sink::default();
        flow.handle(&opaques, &mut sink);

        flow.set_buffer_size(4000);
        assert!(matches!(flow.handle(&opaques, &mut sink), Some(Ok(()))));
        assert_eq!(sink.controls.last().unwrap().1, "4000");
    }
}
