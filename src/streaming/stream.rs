use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use super::{BusMessage, ProgressEvent, SessionChannel};

/// Multicast view of a session.
///
/// Yields replayed events, then live ones, with a heartbeat merged in while
/// the session is idle.  Ends after a terminal event or when the session is
/// closed.  Dropping the stream only unsubscribes this consumer.
pub struct EventStream {
    session_id: String,
    channel: Weak<SessionChannel>,
    replay: VecDeque<ProgressEvent>,
    inner: BroadcastStream<BusMessage>,
    heartbeat: IntervalStream,
    done: bool,
}

impl EventStream {
    pub(crate) fn new(
        channel: &Arc<SessionChannel>,
        replay: VecDeque<ProgressEvent>,
        rx: broadcast::Receiver<BusMessage>,
        heartbeat_interval: Duration,
    ) -> Self {
        let start = tokio::time::Instant::now() + heartbeat_interval;
        let mut ticker = tokio::time::interval_at(start, heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        Self {
            session_id: channel.session_id().to_string(),
            channel: Arc::downgrade(channel),
            replay,
            inner: BroadcastStream::new(rx),
            heartbeat: IntervalStream::new(ticker),
            done: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn deliver(&mut self, event: ProgressEvent) -> Poll<Option<ProgressEvent>> {
        if event.is_terminal() {
            self.done = true;
        }
        Poll::Ready(Some(event))
    }
}

impl Stream for EventStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        if let Some(event) = self.replay.pop_front() {
            return self.deliver(event);
        }

        loop {
            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(BusMessage::Event(event)))) => return self.deliver(event),
                // the stream has its own heartbeat
                Poll::Ready(Some(Ok(BusMessage::Heartbeat))) => continue,
                Poll::Ready(Some(Ok(BusMessage::Closed))) | Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    if let Some(channel) = self.channel.upgrade() {
                        channel.record_lag(skipped);
                    }
                }
                Poll::Pending => break,
            }
        }

        match self.heartbeat.poll_next_unpin(cx) {
            Poll::Ready(Some(_)) => Poll::Ready(Some(ProgressEvent::heartbeat())),
            _ => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::StreamingConfig;
    use crate::streaming::{EventType, ProgressEvent, StreamingBus};
    use futures::StreamExt;

    #[tokio::test]
    async fn idle_stream_emits_heartbeats() {
        let bus = StreamingBus::new(StreamingConfig {
            heartbeat_interval_secs: 1,
            ..Default::default()
        });
        bus.ensure_session("s1");
        let mut stream = bus.subscribe("s1").unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(3), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.event_type, EventType::Heartbeat);

        bus.send("s1", ProgressEvent::completed("done")).unwrap();
        let mut rest = Vec::new();
        while let Some(e) = stream.next().await {
            rest.push(e.event_type);
        }
        assert_eq!(rest.last(), Some(&EventType::Completed));
    }

    #[tokio::test]
    async fn dropping_a_stream_leaves_the_session_open() {
        let bus = StreamingBus::new(StreamingConfig::default());
        bus.ensure_session("s1");
        let stream = bus.subscribe("s1").unwrap();
        assert_eq!(stream.session_id(), "s1");
        drop(stream);
        assert!(bus.is_active("s1"));
        bus.send("s1", ProgressEvent::step_started("plan")).unwrap();
    }
}
