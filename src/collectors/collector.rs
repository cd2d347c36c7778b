//! Per-provider collector: subscribes to a trace session and runs every
//! delivered record through the normalizer into the processor.

use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::normalize::Normalizer;
use super::processor::EventProcessor;
use super::schema::RawRecord;
use super::session::{SubscriptionHandle, TraceSession};
use crate::error::CaptureError;
use crate::logging::LogHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Idle,
    Subscribed,
    Receiving,
    Closed,
}

impl SubscriptionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SubscriptionState::Idle,
            1 => SubscriptionState::Subscribed,
            2 => SubscriptionState::Receiving,
            _ => SubscriptionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    /// Routed records handed to the processor
    pub dispatched: u64,
    /// Records with no route
    pub dropped: u64,
    /// Records whose handling panicked
    pub failed: u64,
    /// Payload fields that could not be extracted, over all dispatched events
    pub field_failures: u64,
}

#[derive(Default)]
struct Shared {
    state: AtomicU8,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    field_failures: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: SubscriptionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

pub struct EventCollector {
    provider: String,
    normalizer: Arc<Normalizer>,
    processor: Arc<dyn EventProcessor>,
    log: LogHandle,
    shared: Arc<Shared>,
    handle: Option<SubscriptionHandle>,
}

impl EventCollector {
    pub fn new(
        provider: &str,
        normalizer: Arc<Normalizer>,
        processor: Arc<dyn EventProcessor>,
        log: LogHandle,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            normalizer,
            processor,
            log,
            shared: Arc::new(Shared::default()),
            handle: None,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    pub fn stats(&self) -> CollectorStats {
        let s = &self.shared;
        CollectorStats {
            dispatched: s.dispatched.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            field_failures: s.field_failures.load(Ordering::Relaxed),
        }
    }

    /// Install the per-record callback on `session`.
    pub fn start(&mut self, session: &mut TraceSession) -> Result<(), CaptureError> {
        match self.state() {
            SubscriptionState::Idle => {}
            SubscriptionState::Closed => {
                return Err(CaptureError::SessionClosed(session.name().to_string()))
            }
            _ => return Err(CaptureError::AlreadySubscribed(self.provider.clone())),
        }

        let provider = self.provider.clone();
        let normalizer = Arc::clone(&self.normalizer);
        let processor = Arc::clone(&self.processor);
        let shared = Arc::clone(&self.shared);
        let log = self.log.clone();

        self.shared.set_state(SubscriptionState::Subscribed);
        let subscribed = session.subscribe(&self.provider, move |record| {
            log.scope(|| on_record(&provider, record, &normalizer, &*processor, &shared))
        });
        let handle = match subscribed {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.set_state(SubscriptionState::Idle);
                return Err(e);
            }
        };
        self.handle = Some(handle);
        self.log
            .scope(|| info!(provider = %self.provider, session = session.name(), "collector subscribed"));
        Ok(())
    }

    /// Stop subscribing. Records already queued on the session may still be
    /// counted.
    pub fn stop(&mut self, session: &TraceSession) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = session.unsubscribe(&handle) {
                self.log
                    .scope(|| debug!(provider = %self.provider, error = %e, "unsubscribe after session close"));
            }
        }
        self.shared.set_state(SubscriptionState::Closed);
    }
}

/// Callback boundary: nothing raised while handling one record may reach
/// the consumer thread.
fn on_record(
    provider: &str,
    record: &RawRecord,
    normalizer: &Normalizer,
    processor: &dyn EventProcessor,
    shared: &Shared,
) {
    if shared.state() == SubscriptionState::Subscribed {
        shared.set_state(SubscriptionState::Receiving);
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handle_record(record, normalizer, processor)
    }));

    match outcome {
        Ok(Some(field_failures)) => {
            shared.dispatched.fetch_add(1, Ordering::Relaxed);
            shared
                .field_failures
                .fetch_add(field_failures, Ordering::Relaxed);
        }
        Ok(None) => {
            shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Err(payload) => {
            shared.failed.fetch_add(1, Ordering::Relaxed);
            let err = CaptureError::Panicked(panic_message(payload.as_ref()));
            error!(provider, event_id = record.event_id, error = %err, "record handling failed");
        }
    }
}

/// `Some(failed field count)` when an event was dispatched.
fn handle_record(
    record: &RawRecord,
    normalizer: &Normalizer,
    processor: &dyn EventProcessor,
) -> Option<u64> {
    let Some(normalized) = normalizer.normalize(record) else {
        debug!(provider = %record.provider, event_id = record.event_id, "no route for event");
        return None;
    };
    for failure in &normalized.failures {
        warn!(
            event_id = normalized.event.event_id,
            field = failure.field,
            error = %failure.error,
            "field extraction failed"
        );
    }
    let failed = normalized.failures.len() as u64;
    processor.dispatch(normalized.event);
    Some(failed)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{
        ChannelProcessor, DispatchTable, SecurityEvent, UserDataBuilder, POWERSHELL_PROVIDER,
    };
    use chrono::Utc;
    use std::sync::Mutex;

    fn record(event_id: u16, user_data: Vec<u8>) -> RawRecord {
        RawRecord {
            provider: POWERSHELL_PROVIDER.into(),
            event_id,
            opcode: 15,
            process_id: 512,
            thread_id: 3,
            timestamp: Utc::now(),
            user_data,
        }
    }

    fn script(text: &str) -> Vec<u8> {
        UserDataBuilder::new()
            .u32(1)
            .u32(1)
            .utf16(text)
            .utf16("id")
            .utf16("")
            .build()
    }

    fn collector(processor: Arc<dyn EventProcessor>) -> EventCollector {
        EventCollector::new(
            POWERSHELL_PROVIDER,
            Arc::new(Normalizer::new(DispatchTable::all())),
            processor,
            LogHandle::disabled(),
        )
    }

    #[test]
    fn bad_field_still_dispatches_and_loop_continues() {
        let (processor, mut rx) = ChannelProcessor::channel();
        let mut c = collector(Arc::new(processor));
        let mut session = TraceSession::start("t", LogHandle::disabled()).unwrap();
        c.start(&mut session).unwrap();
        assert_eq!(c.state(), SubscriptionState::Subscribed);

        let feeder = session.feeder();
        let broken = UserDataBuilder::new().u32(1).u32(1).raw(&[0x41, 0]).build();
        feeder.push(record(4104, broken)).unwrap();
        feeder.push(record(4104, script("whoami"))).unwrap();
        session.stop();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_id, 1001);
        assert_eq!(first.provider_pid, 512);
        assert!(first.free_text.is_empty());
        assert_eq!(rx.try_recv().unwrap().free_text, "whoami");
        assert!(rx.try_recv().is_err());

        let stats = c.stats();
        assert_eq!(stats.dispatched, 2);
        assert!(stats.field_failures >= 1);
        assert_eq!(c.state(), SubscriptionState::Receiving);
    }

    #[test]
    fn unknown_event_id_dispatches_nothing() {
        let (processor, mut rx) = ChannelProcessor::channel();
        let mut c = collector(Arc::new(processor));
        let mut session = TraceSession::start("t", LogHandle::disabled()).unwrap();
        c.start(&mut session).unwrap();
        session.feeder().push(record(4103, script("x"))).unwrap();
        session.stop();

        assert!(rx.try_recv().is_err());
        assert_eq!(
            c.stats(),
            CollectorStats {
                dropped: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn panicking_processor_is_contained() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        let processor = move |ev: SecurityEvent| {
            if ev.free_text == "boom" {
                panic!("processor exploded");
            }
            sink.lock().unwrap().push(ev.free_text);
        };
        let mut c = collector(Arc::new(processor));
        let mut session = TraceSession::start("t", LogHandle::disabled()).unwrap();
        c.start(&mut session).unwrap();
        let feeder = session.feeder();
        feeder.push(record(4104, script("boom"))).unwrap();
        feeder.push(record(4104, script("after"))).unwrap();
        session.stop();

        assert_eq!(*seen.lock().unwrap(), vec!["after".to_string()]);
        let stats = c.stats();
        assert_eq!((stats.failed, stats.dispatched), (1, 1));
    }

    #[test]
    fn double_start_is_rejected_and_stop_closes() {
        let (processor, _rx) = ChannelProcessor::channel();
        let mut c = collector(Arc::new(processor));
        let mut session = TraceSession::start("t", LogHandle::disabled()).unwrap();
        c.start(&mut session).unwrap();
        assert!(matches!(
            c.start(&mut session),
            Err(CaptureError::AlreadySubscribed(_))
        ));
        c.stop(&session);
        assert_eq!(c.state(), SubscriptionState::Closed);
        assert!(c.start(&mut session).is_err());
    }
}
