//! Stream throttling utilities

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};

/// Extension trait to add throttling to any Stream
pub trait ThrottleExt: Stream {
    /// Throttle the stream to emit at most once per interval
    ///
    /// Uses "latest-wins" semantics - if multiple items arrive
    /// during an interval, only the latest is emitted.
    fn throttle(self, duration: Duration) -> Throttle<Self>
    where
        Self: Sized,
    {
        Throttle::new(self, duration)
    }
}

impl<T: Stream> ThrottleExt for T {}

pin_project! {
    /// A stream combinator that throttles emission rate
    pub struct Throttle<S: Stream> {
        #[pin]
        stream: S,
        interval: Interval,
        pending: Option<S::Item>,
        ended: bool,
    }
}

impl<S: Stream> Throttle<S> {
    /// Create a new throttled stream
    ///
    /// The first item is emitted as soon as it arrives.
    pub fn new(stream: S, duration: Duration) -> Self {
        let mut interval = interval(duration);
        // Don't burst after a slow consumer
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { stream, interval, pending: None, ended: false }
    }
}

impl<S: Stream> Stream for Throttle<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Drain all available items, keeping only the latest
        while !*this.ended {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => *this.pending = Some(item),
                Poll::Ready(None) => *this.ended = true,
                Poll::Pending => break,
            }
        }

        if this.pending.is_none() {
            return if *this.ended { Poll::Ready(None) } else { Poll::Pending };
        }

        ready!(this.interval.poll_tick(cx));
        Poll::Ready(this.pending.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::watch;
    use tokio_stream::wrappers::WatchStream;

    #[tokio::test(start_paused = true)]
    async fn keeps_latest_value_per_interval() {
        let (tx, rx) = watch::channel(0.0f64);
        let mut stream = WatchStream::from_changes(rx).throttle(Duration::from_millis(100));

        tx.send_replace(1.0);
        assert_eq!(stream.next().await, Some(1.0));

        tx.send_replace(2.0);
        tx.send_replace(3.0);
        let start = tokio::time::Instant::now();
        assert_eq!(stream.next().await, Some(3.0));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn ends_with_the_source() {
        let stream = futures::stream::iter([1, 2, 3]).throttle(Duration::from_millis(10));
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items, [3]);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_source_does_not_end_stream() {
        let (tx, rx) = watch::channel(0u32);
        let mut stream = WatchStream::from_changes(rx).throttle(Duration::from_millis(10));

        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send_replace(7);
        });
        assert_eq!(stream.next().await, Some(7));
        sender.await.unwrap();
    }
}
