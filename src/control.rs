//! Connection-start feature negotiation and noop liveness.
//!
//! Each feature-enable control message is emitted exactly once, one per
//! step call, in a fixed order. The noop monitor doubles as the liveness
//! watchdog: a connection that has not seen a noop for twice the agreed
//! interval is dead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{DcpError, EngineResult};
use crate::opaque::OpaqueCounter;
use crate::producers::MessageProducers;

pub const ENABLE_NOOP_KEY: &str = "enable_noop";
pub const SET_NOOP_INTERVAL_KEY: &str = "set_noop_interval";
pub const SET_PRIORITY_KEY: &str = "set_priority";
pub const ENABLE_EXT_METADATA_KEY: &str = "enable_ext_metadata";
pub const ENABLE_VALUE_COMPRESSION_KEY: &str = "enable_value_compression";
pub const CURSOR_DROPPING_KEY: &str = "supports_cursor_dropping";

fn take(flag: &AtomicBool) -> bool {
    flag.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Noop negotiation and inactivity watchdog.
#[derive(Debug)]
pub struct NoopMonitor {
    negotiated: bool,
    interval: Duration,
    pending_enable: AtomicBool,
    pending_interval: AtomicBool,
    last_noop: Mutex<Instant>,
}

impl NoopMonitor {
    pub fn new(config: &Config) -> Self {
        Self::with_interval(config.dcp_enable_noop, config.noop_interval())
    }

    pub fn with_interval(negotiated: bool, interval: Duration) -> Self {
        Self {
            negotiated,
            interval,
            pending_enable: AtomicBool::new(negotiated),
            pending_interval: AtomicBool::new(negotiated),
            last_noop: Mutex::new(Instant::now()),
        }
    }

    /// Record an inbound noop.
    pub fn on_noop(&self) {
        *self.last_noop.lock().expect("noop clock lock poisoned") = Instant::now();
    }

    pub fn since_last_noop(&self) -> Duration {
        self.last_noop
            .lock()
            .expect("noop clock lock poisoned")
            .elapsed()
    }

    /// One outbound attempt: the enable and interval messages first, then
    /// the liveness check. `None` means nothing to do.
    pub fn handle(
        &self,
        opaques: &OpaqueCounter,
        producers: &mut dyn MessageProducers,
    ) -> Option<EngineResult> {
        if take(&self.pending_enable) {
            return Some(producers.control(opaques.next(), ENABLE_NOOP_KEY, b"true"));
        }

        if take(&self.pending_interval) {
            let secs = self.interval.as_secs().to_string();
            return Some(producers.control(opaques.next(), SET_NOOP_INTERVAL_KEY, secs.as_bytes()));
        }

        if self.negotiated && self.since_last_noop() > self.interval * 2 {
            tracing::warn!(
                target: "dcp",
                interval_secs = self.interval.as_secs(),
                "disconnecting: no noop received within twice the noop interval"
            );
            return Some(Err(DcpError::Disconnect));
        }

        None
    }
}

/// Remaining one-shot feature enables, emitted in fixed order after the
/// noop pair.
#[derive(Debug)]
pub struct ControlNegotiator {
    pending_set_priority: AtomicBool,
    pending_ext_metadata: AtomicBool,
    pending_value_compression: AtomicBool,
    pending_cursor_dropping: AtomicBool,
}

impl ControlNegotiator {
    pub fn new(config: &Config) -> Self {
        Self {
            pending_set_priority: AtomicBool::new(true),
            pending_ext_metadata: AtomicBool::new(true),
            pending_value_compression: AtomicBool::new(config.dcp_value_compression_enabled),
            pending_cursor_dropping: AtomicBool::new(true),
        }
    }

    pub fn handle_priority(
        &self,
        opaques: &OpaqueCounter,
        producers: &mut dyn MessageProducers,
    ) -> Option<EngineResult> {
        take(&self.pending_set_priority)
            .then(|| producers.control(opaques.next(), SET_PRIORITY_KEY, b"high"))
    }

    pub fn handle_ext_metadata(
        &self,
        opaques: &OpaqueCounter,
        producers: &mut dyn MessageProducers,
    ) -> Option<EngineResult> {
        take(&self.pending_ext_metadata)
            .then(|| producers.control(opaques.next(), ENABLE_EXT_METADATA_KEY, b"true"))
    }

    pub fn handle_value_compression(
        &self,
        opaques: &OpaqueCounter,
        producers: &mut dyn MessageProducers,
    ) -> Option<EngineResult> {
        take(&self.pending_value_compression)
            .then(|| producers.control(opaques.next(), ENABLE_VALUE_COMPRESSION_KEY, b"true"))
    }

    pub fn handle_cursor_dropping(
        &self,
        opaques: &OpaqueCounter,
        producers: &mut dyn MessageProducers,
    ) -> Option<EngineResult> {
        take(&self.pending_cursor_dropping)
            .then(|| producers.control(opaques.next(), CURSOR_DROPPING_KEY, b"true"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Vbid;
    use crate::wire::ResponseStatus;

    #[derive(Default)]
    struct Sink {
        controls: Vec<(String, String)>,
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

        fn buffer_ack(&mut self, _opaque: u32, _buffer_bytes: u32) -> EngineResult {
            Ok(())
        }

        fn control(&mut self, _opaque: u32, key: &str, value: &[u8]) -> EngineResult {
            self.controls
                .push((key.to_string(), String::from_utf8_lossy(value).into_owned()));
            Ok(())
        }
    }

    fn drain(
        noop: &NoopMonitor,
        negotiator: &ControlNegotiator,
        opaques: &OpaqueCounter,
        sink: &mut Sink,
    ) {
        loop {
            if noop.handle(opaques, sink).is_some() {
                continue;
            }
            if negotiator.handle_priority(opaques, sink).is_some()
                || negotiator.handle_ext_metadata(opaques, sink).is_some()
                || negotiator.handle_value_compression(opaques, sink).is_some()
                || negotiator.handle_cursor_dropping(opaques, sink).is_some()
            {
                continue;
            }
            break;
        }
    }

    #[test]
    fn negotiation_emits_each_key_once_in_order() {
        let config = Config {
            dcp_value_compression_enabled: true,
            dcp_noop_interval_secs: 60,
            ..Config::default()
        };
        let noop = NoopMonitor::new(&config);
        let negotiator = ControlNegotiator::new(&config);
        let opaques = OpaqueCounter::new();
        let mut sink = Sink::default();

        drain(&noop, &negotiator, &opaques, &mut sink);

        let keys: Vec<&str> = sink.controls.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "enable_noop",
                "set_noop_interval",
                "set_priority",
                "enable_ext_metadata",
                "enable_value_compression",
                "supports_cursor_dropping",
            ]
        );
        assert_eq!(sink.controls[1].1, "60");

        // A second pass emits nothing.
        drain(&noop, &negotiator, &opaques, &mut sink);
        assert_eq!(sink.controls.len(), 6);
    }

    #[test]
    fn compression_skipped_when_disabled() {
        let config = Config {
            dcp_value_compression_enabled: false,
            ..Config::default()
        };
        let negotiator = ControlNegotiator::new(&config);
        let opaques = OpaqueCounter::new();
        let mut sink = Sink::default();
        assert!(negotiator
            .handle_value_compression(&opaques, &mut sink)
            .is_none());
    }

    #[test]
    fn noop_timeout_disconnects() {
        let noop = NoopMonitor::with_interval(true, Duration::from_millis(20));
        let opaques = OpaqueCounter::new();
        let mut sink = Sink::default();

        // Consume the two pending enables.
        assert!(matches!(noop.handle(&opaques, &mut sink), Some(Ok(()))));
        assert!(matches!(noop.handle(&opaques, &mut sink), Some(Ok(()))));
        assert!(noop.handle(&opaques, &mut sink).is_none());

        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            noop.handle(&opaques, &mut sink),
            Some(Err(DcpError::Disconnect))
        ));

        // A fresh noop resets the clock.
        noop.on_noop();
        assert!(noop.handle(&opaques, &mut sink).is_none());
    }

    #[test]
    fn unnegotiated_noop_never_disconnects() {
        let noop = NoopMonitor::with_interval(false, Duration::from_millis(1));
        let opaques = OpaqueCounter::new();
        let mut sink = Sink::default();
        std::thread::sleep(Duration::from_millis(10));
        assert!(noop.handle(&opaques, &mut sink).is_none());
        assert!(sink.controls.is_empty());
    }
}
