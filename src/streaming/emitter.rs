use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{BusInner, BusMessage, ProgressEvent, SessionChannel};

/// The single push-style consumer of a session.
///
/// Delivers buffered events first, then live ones, in emission order.
/// Dropping or closing the emitter closes the session; the producing chain
/// keeps running and its later events are discarded.
pub struct SessionEmitter {
    bus: Arc<BusInner>,
    channel: Arc<SessionChannel>,
    replay: VecDeque<ProgressEvent>,
    rx: broadcast::Receiver<BusMessage>,
    done: bool,
}

impl std::fmt::Debug for SessionEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEmitter")
            .field("session_id", &self.channel.session_id())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl SessionEmitter {
    pub(crate) fn new(
        bus: Arc<BusInner>,
        channel: Arc<SessionChannel>,
        replay: VecDeque<ProgressEvent>,
        rx: broadcast::Receiver<BusMessage>,
    ) -> Self {
        Self {
            bus,
            channel,
            replay,
            rx,
            done: false,
        }
    }

    pub fn session_id(&self) -> &str {
        self.channel.session_id()
    }

    /// Next event, or `None` once a terminal event was delivered or the
    /// session was closed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        if let Some(event) = self.replay.pop_front() {
            return Some(self.deliver(event));
        }

        loop {
            match self.rx.recv().await {
                Ok(BusMessage::Event(event)) => return Some(self.deliver(event)),
                Ok(BusMessage::Heartbeat) => return Some(ProgressEvent::heartbeat()),
                Ok(BusMessage::Closed) | Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
                Err(RecvError::Lagged(skipped)) => self.channel.record_lag(skipped),
            }
        }
    }

    fn deliver(&mut self, event: ProgressEvent) -> ProgressEvent {
        if event.is_terminal() {
            self.done = true;
        }
        event
    }

    /// Events this emitter's session lost to slow consumers.
    pub fn lagged(&self) -> u64 {
        self.channel.lagged.load(Ordering::Relaxed)
    }

    /// Close the session.  Same as dropping the emitter.
    pub fn close(self) {}
}

impl Drop for SessionEmitter {
    fn drop(&mut self) {
        self.channel.detach_push();
        self.bus.release(&self.channel);
    }
}
