//! In-process trace session.
//!
//! One consumer thread per session. Records pushed through a
//! [`RecordFeeder`] are delivered to every callback subscribed to the
//! record's provider, synchronously and in arrival order. Subscriptions and
//! records travel on the same channel, so a subscription sees exactly the
//! records pushed after it was made.

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::{debug, info};

use super::schema::RawRecord;
use crate::error::CaptureError;
use crate::logging::LogHandle;

pub type RecordCallback = Box<dyn FnMut(&RawRecord) + Send>;

enum Command {
    Subscribe {
        id: u64,
        provider: String,
        callback: RecordCallback,
    },
    Unsubscribe(u64),
    Record(RawRecord),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    provider: String,
}

impl SubscriptionHandle {
    pub fn provider(&self) -> &str {
        &self.provider
    }
}

/// Pushes records into a session. Cheap to clone.
#[derive(Clone)]
pub struct RecordFeeder {
    session: String,
    tx: mpsc::Sender<Command>,
}

impl RecordFeeder {
    pub fn push(&self, record: RawRecord) -> Result<(), CaptureError> {
        self.tx
            .send(Command::Record(record))
            .map_err(|_| CaptureError::SessionClosed(self.session.clone()))
    }
}

pub struct TraceSession {
    name: String,
    tx: mpsc::Sender<Command>,
    next_id: u64,
    worker: Option<JoinHandle<u64>>,
}

impl TraceSession {
    /// Start the session's consumer thread. `log` is installed on that thread
    /// for its lifetime.
    pub fn start(name: &str, log: LogHandle) -> Result<Self, CaptureError> {
        let (tx, rx) = mpsc::channel();
        let thread_name = format!("trace-{name}");
        let session = name.to_string();
        let worker = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let _guard = log.enter();
                consume(&session, rx)
            })?;
        info!(session = name, "trace session started");
        Ok(Self {
            name: name.to_string(),
            tx,
            next_id: 0,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(
        &mut self,
        provider: &str,
        callback: impl FnMut(&RawRecord) + Send + 'static,
    ) -> Result<SubscriptionHandle, CaptureError> {
        self.next_id += 1;
        let handle = SubscriptionHandle {
            id: self.next_id,
            provider: provider.to_string(),
        };
        self.send(Command::Subscribe {
            id: handle.id,
            provider: handle.provider.clone(),
            callback: Box::new(callback),
        })?;
        Ok(handle)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), CaptureError> {
        self.send(Command::Unsubscribe(handle.id))
    }

    pub fn feeder(&self) -> RecordFeeder {
        RecordFeeder {
            session: self.name.clone(),
            tx: self.tx.clone(),
        }
    }

    /// Deliver everything already queued, then stop the consumer thread.
    /// Returns how many records were delivered.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn send(&self, command: Command) -> Result<(), CaptureError> {
        self.tx
            .send(command)
            .map_err(|_| CaptureError::SessionClosed(self.name.clone()))
    }

    fn shutdown(&mut self) -> u64 {
        let Some(worker) = self.worker.take() else {
            return 0;
        };
        let _ = self.tx.send(Command::Stop);
        let delivered = worker.join().unwrap_or(0);
        info!(session = %self.name, delivered, "trace session stopped");
        delivered
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consume(session: &str, rx: mpsc::Receiver<Command>) -> u64 {
    let mut subscribers: HashMap<String, Vec<(u64, RecordCallback)>> = HashMap::new();
    let mut delivered = 0u64;

    while let Ok(command) = rx.recv() {
        match command {
            Command::Subscribe {
                id,
                provider,
                callback,
            } => {
                debug!(session, provider = %provider, "provider subscribed");
                subscribers.entry(provider).or_default().push((id, callback));
            }
            Command::Unsubscribe(id) => {
                for callbacks in subscribers.values_mut() {
                    callbacks.retain(|(cid, _)| *cid != id);
                }
            }
            Command::Record(record) => {
                if let Some(callbacks) = subscribers.get_mut(&record.provider) {
                    for (_, callback) in callbacks.iter_mut() {
                        callback(&record);
                    }
                    delivered += 1;
                }
            }
            Command::Stop => break,
        }
    }
    delivered
}
