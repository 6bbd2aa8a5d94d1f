//! Per-session progress delivery.
//!
//! Every session owns one broadcast channel.  Two adapters read from it:
//! [`SessionEmitter`], the single push-style consumer with an explicit close,
//! and [`EventStream`], a multicast [`futures::Stream`] with its own
//! heartbeat.  Producers never block: a slow consumer lags and loses events
//! rather than stalling the chain.
//!
//! A `completed` or `error` event is the last thing a session accepts.  The
//! registry entry is removed as soon as one is published.

pub mod emitter;
pub mod event;
pub mod reporter;
pub mod stream;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StreamingConfig;
use crate::error::StreamingError;

pub use emitter::SessionEmitter;
pub use event::{EventType, ProgressEvent};
pub use reporter::ProgressReporter;
pub use stream::EventStream;

/// What travels over a session's broadcast channel.
#[derive(Debug, Clone)]
pub(crate) enum BusMessage {
    Event(ProgressEvent),
    /// Keep-alive from the maintenance task.  Surfaced by the emitter only;
    /// streams run their own heartbeat.
    Heartbeat,
    Closed,
}

pub(crate) struct SessionChannel {
    session_id: String,
    tx: broadcast::Sender<BusMessage>,
    /// Recent events for late consumers.  Publishing and subscribing both
    /// happen under this lock so nothing is lost or duplicated.
    replay: Mutex<VecDeque<ProgressEvent>>,
    replay_capacity: usize,
    closed: AtomicBool,
    push_attached: AtomicBool,
    sent: AtomicU64,
    rejected: AtomicU64,
    lagged: AtomicU64,
    started: Instant,
    created_at: DateTime<Utc>,
}

impl SessionChannel {
    fn new(session_id: &str, config: &StreamingConfig) -> Self {
        let (tx, _) = broadcast::channel(config.buffer_capacity.max(1));
        Self {
            session_id: session_id.to_string(),
            tx,
            replay: Mutex::new(VecDeque::with_capacity(config.replay_capacity)),
            replay_capacity: config.replay_capacity,
            closed: AtomicBool::new(false),
            push_attached: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            lagged: AtomicU64::new(0),
            started: Instant::now(),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publish an event.  Returns whether it was terminal.
    fn publish(&self, event: ProgressEvent) -> Result<bool, StreamingError> {
        let mut replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(StreamingError::SessionTerminated(self.session_id.clone()));
        }

        let terminal = event.is_terminal();
        if terminal {
            self.closed.store(true, Ordering::Release);
        }

        if self.replay_capacity > 0 {
            if replay.len() == self.replay_capacity {
                replay.pop_front();
            }
            replay.push_back(event.clone());
        }

        // no receivers is fine: the replay buffer still has it
        let _ = self.tx.send(BusMessage::Event(event));
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(terminal)
    }

    /// Snapshot the replay buffer and subscribe in one step.
    pub(crate) fn attach(
        &self,
    ) -> Result<(VecDeque<ProgressEvent>, broadcast::Receiver<BusMessage>), StreamingError> {
        let replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return Err(StreamingError::SessionTerminated(self.session_id.clone()));
        }
        Ok((replay.clone(), self.tx.subscribe()))
    }

    /// Mark closed and wake every consumer.  Returns false if it already was.
    fn shut(&self) -> bool {
        let _replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
        let was_closed = self.closed.swap(true, Ordering::AcqRel);
        let _ = self.tx.send(BusMessage::Closed);
        !was_closed
    }

    pub(crate) fn record_lag(&self, skipped: u64) {
        self.lagged.fetch_add(skipped, Ordering::Relaxed);
        let err = StreamingError::Overflow {
            session_id: self.session_id.clone(),
            skipped,
        };
        warn!(session_id = %self.session_id, skipped, "{err}");
    }

    pub(crate) fn detach_push(&self) {
        self.push_attached.store(false, Ordering::Release);
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            events_sent: self.sent.load(Ordering::Relaxed),
            events_rejected: self.rejected.load(Ordering::Relaxed),
            events_lagged: self.lagged.load(Ordering::Relaxed),
            subscribers: self.tx.receiver_count(),
            push_attached: self.push_attached.load(Ordering::Acquire),
            created_at: self.created_at,
            age_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Delivery counters for one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub events_sent: u64,
    /// Events refused because the session had already terminated.
    pub events_rejected: u64,
    /// Events dropped because a consumer fell behind.
    pub events_lagged: u64,
    pub subscribers: usize,
    pub push_attached: bool,
    pub created_at: DateTime<Utc>,
    pub age_secs: u64,
}

pub(crate) struct BusInner {
    sessions: DashMap<String, Arc<SessionChannel>>,
    config: StreamingConfig,
}

impl BusInner {
    /// Remove `channel` from the registry if it is still the registered one,
    /// then close it.
    pub(crate) fn release(&self, channel: &Arc<SessionChannel>) {
        self.sessions
            .remove_if(channel.session_id(), |_, v| Arc::ptr_eq(v, channel));
        if channel.shut() {
            info!(session_id = %channel.session_id(), "session closed");
        }
    }
}

/// Registry of live sessions.  Cheap to clone.
#[derive(Clone)]
pub struct StreamingBus {
    inner: Arc<BusInner>,
}

impl StreamingBus {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                sessions: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.inner.config
    }

    /// The live channel for `session_id`, created if absent.  A channel that
    /// terminated but was not yet removed is replaced.
    pub(crate) fn ensure_channel(&self, session_id: &str) -> Arc<SessionChannel> {
        let fresh = || Arc::new(SessionChannel::new(session_id, &self.inner.config));
        match self.inner.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut o) => {
                if o.get().is_closed() {
                    o.insert(fresh());
                }
                o.get().clone()
            }
            Entry::Vacant(v) => {
                debug!(session_id, "session opened");
                v.insert(fresh()).value().clone()
            }
        }
    }

    /// Open a session without attaching a consumer.  Events published
    /// before anyone attaches are kept in the replay buffer.
    pub fn ensure_session(&self, session_id: &str) {
        self.ensure_channel(session_id);
    }

    /// Attach the single push-style consumer for `session_id`, opening the
    /// session if needed.
    pub fn create_session(&self, session_id: &str) -> Result<SessionEmitter, StreamingError> {
        let channel = self.ensure_channel(session_id);
        if channel.push_attached.swap(true, Ordering::AcqRel) {
            return Err(StreamingError::SessionAlreadyAttached(session_id.to_string()));
        }
        let (replay, rx) = match channel.attach() {
            Ok(parts) => parts,
            Err(e) => {
                channel.detach_push();
                return Err(e);
            }
        };
        info!(session_id, replayed = replay.len(), "session emitter attached");
        Ok(SessionEmitter::new(self.inner.clone(), channel, replay, rx))
    }

    /// Multicast subscription to an existing session.
    pub fn subscribe(&self, session_id: &str) -> Result<EventStream, StreamingError> {
        let channel = self
            .inner
            .sessions
            .get(session_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| StreamingError::SessionNotFound(session_id.to_string()))?;
        let (replay, rx) = channel.attach()?;
        debug!(session_id, replayed = replay.len(), "stream subscribed");
        Ok(EventStream::new(
            &channel,
            replay,
            rx,
            self.inner.config.heartbeat_interval(),
        ))
    }

    /// Publish to a session.  A terminal event closes the session and
    /// removes it from the registry.
    pub fn send(&self, session_id: &str, event: ProgressEvent) -> Result<(), StreamingError> {
        let channel = self
            .inner
            .sessions
            .get(session_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| StreamingError::SessionNotFound(session_id.to_string()))?;

        let event_type = event.event_type;
        if channel.publish(event)? {
            self.inner
                .sessions
                .remove_if(session_id, |_, v| Arc::ptr_eq(v, &channel));
            info!(session_id, event_type = ?event_type, "session finished");
        }
        Ok(())
    }

    /// Close a session explicitly.  Consumers see the end of the stream.
    pub fn close(&self, session_id: &str) -> Result<(), StreamingError> {
        let (_, channel) = self
            .inner
            .sessions
            .remove(session_id)
            .ok_or_else(|| StreamingError::SessionNotFound(session_id.to_string()))?;
        if channel.shut() {
            info!(session_id, "session closed");
        }
        Ok(())
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.inner.sessions.contains_key(session_id)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn session_stats(&self, session_id: &str) -> Option<SessionStats> {
        self.inner.sessions.get(session_id).map(|c| c.stats())
    }

    /// Send a keep-alive to every open session.  Returns how many sessions
    /// had at least one consumer to receive it.
    pub fn heartbeat_all(&self) -> usize {
        let channels: Vec<Arc<SessionChannel>> =
            self.inner.sessions.iter().map(|r| r.value().clone()).collect();

        let mut delivered = 0;
        for channel in channels {
            if channel.is_closed() {
                continue;
            }
            match channel.tx.send(BusMessage::Heartbeat) {
                Ok(_) => delivered += 1,
                Err(_) => debug!(session_id = %channel.session_id(), "heartbeat had no receivers"),
            }
        }
        delivered
    }

    /// Close every session older than the configured timeout.  Returns the
    /// number reaped.
    pub fn reap_expired(&self) -> usize {
        let timeout = self.inner.config.session_timeout();
        let expired: Vec<Arc<SessionChannel>> = self
            .inner
            .sessions
            .iter()
            .filter(|r| r.value().started.elapsed() >= timeout)
            .map(|r| r.value().clone())
            .collect();

        for channel in &expired {
            warn!(
                session_id = %channel.session_id(),
                age_secs = channel.started.elapsed().as_secs(),
                "session timed out"
            );
            self.inner.release(channel);
        }
        expired.len()
    }

    /// Periodic heartbeat and expiry until `shutdown` fires.
    pub fn spawn_maintenance(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let bus = self.clone();
        let period = self.inner.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "streaming maintenance started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = bus.reap_expired();
                        let beats = bus.heartbeat_all();
                        debug!(reaped, beats, "streaming maintenance tick");
                    }
                    _ = shutdown.recv() => {
                        info!("streaming maintenance shutting down");
                        break;
                    }
                }
            }
        })
    }
}
