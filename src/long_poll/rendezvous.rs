//! FIFO hand-off between producers and consumers.
//!
//! The queue keeps two backlogs behind one lock: values nobody has asked for
//! yet (supply) and consumers waiting for a value (demand). Every match is
//! made while holding the lock, so a value is delivered to exactly one
//! consumer. Blocking operations take a cancellation future; when it fires
//! the operation's entry is withdrawn under the same lock, so a racing match
//! either happened completely or not at all.

use std::{fmt, future::Future};

use parking_lot::Mutex;
use snafu::Snafu;
use tokio::sync::{Notify, oneshot};

use super::ring_buffer::RingBuffer;

/// A blocking operation was cancelled before it could complete.
#[derive(Debug, Snafu)]
#[snafu(display("rendezvous operation cancelled"))]
pub struct Cancelled;

/// A blocking enqueue was cancelled before any consumer claimed the value;
/// the value is handed back so the producer can retry.
pub struct Unclaimed<T>(pub T);

impl<T> Unclaimed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Unclaimed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unclaimed(..)")
    }
}

impl<T> fmt::Display for Unclaimed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("enqueue cancelled before the value was claimed")
    }
}

impl<T> std::error::Error for Unclaimed<T> {}

struct Supply<T> {
    ticket: u64,
    value: T,
    /// Present when a blocking producer waits for the value to be taken.
    claimed: Option<oneshot::Sender<()>>,
}

struct Demand<T> {
    ticket: u64,
    deliver: oneshot::Sender<T>,
}

struct State<T> {
    supply: RingBuffer<Supply<T>>,
    demand: RingBuffer<Demand<T>>,
    next_ticket: u64,
}

impl<T> State<T> {
    fn ticket(&mut self) -> u64 {
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.next_ticket
    }

    /// Hands `value` to the oldest live consumer. Returns it if none is waiting.
    fn offer(&mut self, mut value: T) -> Option<T> {
        while let Some(waiting) = self.demand.pop_front() {
            match waiting.deliver.send(value) {
                Ok(()) => return None,
                Err(returned) => value = returned,
            }
        }
        Some(value)
    }

    fn take(&mut self) -> Option<T> {
        let supply = self.supply.pop_front()?;
        if let Some(claimed) = supply.claimed {
            let _ = claimed.send(());
        }
        Some(supply.value)
    }
}

pub struct RendezvousQueue<T> {
    state: Mutex<State<T>>,
    available: Notify,
}

impl<T> RendezvousQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                supply: RingBuffer::new(),
                demand: RingBuffer::new(),
                next_ticket: 0,
            }),
            available: Notify::new(),
        }
    }

    /// Number of values waiting for a consumer.
    pub fn len(&self) -> usize {
        self.state.lock().supply.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of consumers blocked in [`dequeue`](Self::dequeue).
    pub fn waiting_consumers(&self) -> usize {
        self.state.lock().demand.len()
    }

    /// Hands `value` to a waiting consumer or appends it to the backlog,
    /// without waiting for it to be claimed.
    pub fn push(&self, value: T) {
        let mut state = self.state.lock();
        if let Some(value) = state.offer(value) {
            let ticket = state.ticket();
            state.supply.push_back(Supply {
                ticket,
                value,
                claimed: None,
            });
            drop(state);
            self.available.notify_waiters();
        }
    }

    /// Delivers `value` only if a consumer is already waiting.
    pub fn try_enqueue(&self, value: T) -> Result<(), T> {
        match self.state.lock().offer(value) {
            None => Ok(()),
            Some(value) => Err(value),
        }
    }

    /// Delivers `value` and waits until a consumer has taken it.
    ///
    /// If `cancelled` resolves first and the value is still in the backlog it
    /// is withdrawn and returned in [`Unclaimed`]. If a consumer took it in
    /// the meantime the enqueue counts as successful.
    pub async fn enqueue<C>(&self, value: T, cancelled: C) -> Result<(), Unclaimed<T>>
    where
        C: Future<Output = ()>,
    {
        let (ticket, claimed) = {
            let mut state = self.state.lock();
            let Some(value) = state.offer(value) else {
                return Ok(());
            };
            let (tx, rx) = oneshot::channel();
            let ticket = state.ticket();
            state.supply.push_back(Supply {
                ticket,
                value,
                claimed: Some(tx),
            });
            (ticket, rx)
        };
        self.available.notify_waiters();

        let mut guard = SupplyGuard {
            queue: self,
            ticket,
            settled: false,
        };

        tokio::pin!(cancelled);
        tokio::select! {
            biased;
            _ = claimed => {
                guard.settled = true;
                Ok(())
            }
            _ = &mut cancelled => {
                guard.settled = true;
                match self.withdraw_supply(ticket) {
                    Some(value) => Err(Unclaimed(value)),
                    None => Ok(()),
                }
            }
        }
    }

    /// Takes the oldest backlog value without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        self.state.lock().take()
    }

    /// Takes the oldest value, waiting for a producer if the backlog is empty.
    ///
    /// A value matched to this call is never dropped: if cancellation wins the
    /// race after a producer already delivered, the value is returned, and if
    /// the future itself is dropped the value goes back to the head of the
    /// queue.
    pub async fn dequeue<C>(&self, cancelled: C) -> Result<T, Cancelled>
    where
        C: Future<Output = ()>,
    {
        let (ticket, receiver) = {
            let mut state = self.state.lock();
            if let Some(value) = state.take() {
                return Ok(value);
            }
            let (tx, rx) = oneshot::channel();
            let ticket = state.ticket();
            state.demand.push_back(Demand {
                ticket,
                deliver: tx,
            });
            (ticket, rx)
        };

        let mut guard = DemandGuard {
            queue: self,
            ticket,
            receiver: Some(receiver),
        };

        tokio::pin!(cancelled);
        let delivered = {
            let Some(receiver) = guard.receiver.as_mut() else {
                return Err(Cancelled);
            };
            tokio::select! {
                biased;
                delivered = receiver => delivered.ok(),
                _ = &mut cancelled => None,
            }
        };

        match delivered {
            Some(value) => {
                guard.receiver = None;
                Ok(value)
            }
            None => guard.settle().ok_or(Cancelled),
        }
    }

    /// Clones the oldest backlog value without claiming it.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state.lock().supply.front().map(|s| s.value.clone())
    }

    /// Inspects the oldest backlog value in place.
    pub fn peek_with<R>(&self, inspect: impl FnOnce(&T) -> R) -> Option<R> {
        self.state.lock().supply.front().map(|s| inspect(&s.value))
    }

    /// Waits until the backlog holds a value and returns a clone of the oldest.
    pub async fn peek<C>(&self, cancelled: C) -> Result<T, Cancelled>
    where
        T: Clone,
        C: Future<Output = ()>,
    {
        tokio::pin!(cancelled);
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_peek() {
                return Ok(value);
            }

            tokio::select! {
                biased;
                _ = &mut notified => continue,
                _ = &mut cancelled => return Err(Cancelled),
            }
        }
    }

    /// Drops every buffered value. Blocked producers are released as if the
    /// value had been claimed.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let mut dropped = 0;
        while state.take().is_some() {
            dropped += 1;
        }
        dropped
    }

    fn withdraw_supply(&self, ticket: u64) -> Option<T> {
        self.state
            .lock()
            .supply
            .remove_first(|s| s.ticket == ticket)
            .map(|s| s.value)
    }
}

impl<T> Default for RendezvousQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for RendezvousQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RendezvousQueue")
            .field("backlog", &state.supply.len())
            .field("waiting_consumers", &state.demand.len())
            .finish()
    }
}

struct SupplyGuard<'a, T> {
    queue: &'a RendezvousQueue<T>,
    ticket: u64,
    settled: bool,
}

impl<T> Drop for SupplyGuard<'_, T> {
    fn drop(&mut self) {
        if !self.settled {
            // Abandoned producer: the value must not be delivered later.
            let _ = self.queue.withdraw_supply(self.ticket);
        }
    }
}

struct DemandGuard<'a, T> {
    queue: &'a RendezvousQueue<T>,
    ticket: u64,
    receiver: Option<oneshot::Receiver<T>>,
}

impl<T> DemandGuard<'_, T> {
    /// Withdraws the pending claim. Returns a value a producer delivered
    /// before the claim could be withdrawn.
    fn settle(&mut self) -> Option<T> {
        let mut receiver = self.receiver.take()?;
        let mut state = self.queue.state.lock();
        if state
            .demand
            .remove_first(|d| d.ticket == self.ticket)
            .is_some()
        {
            return None;
        }
        receiver.try_recv().ok()
    }
}

impl<T> Drop for DemandGuard<'_, T> {
    fn drop(&mut self) {
        let Some(value) = self.settle() else {
            return;
        };
        let mut state = self.queue.state.lock();
        if let Some(value) = state.offer(value) {
            let ticket = state.ticket();
            state.supply.push_front(Supply {
                ticket,
                value,
                claimed: None,
            });
            drop(state);
            self.queue.available.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use futures::FutureExt;
    use proptest::prelude::*;
    use tokio_test::{assert_pending, assert_ready, task};
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn backlog_is_fifo() {
        let queue = RendezvousQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_peek(), Some(1));
        assert_eq!(queue.dequeue(std::future::pending()).await.ok(), Some(1));
        assert_eq!(queue.try_dequeue(), Some(2));
        assert_eq!(queue.try_dequeue(), Some(3));
        assert_eq!(queue.try_dequeue(), None);
    }

    #[tokio::test]
    async fn waiting_consumer_gets_value_directly() {
        let queue = RendezvousQueue::new();
        let mut consumer = task::spawn(queue.dequeue(std::future::pending()));
        assert_pending!(consumer.poll());
        assert_eq!(queue.waiting_consumers(), 1);

        queue.push("hello");
        assert!(queue.is_empty());
        let value = assert_ready!(consumer.poll());
        assert_eq!(value.ok(), Some("hello"));
    }

    #[test]
    fn non_blocking_operations_never_register() {
        let queue = RendezvousQueue::new();
        assert_eq!(queue.try_enqueue(5), Err(5));
        assert_eq!(queue.try_dequeue(), None::<i32>);
        assert_eq!(queue.waiting_consumers(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn try_enqueue_matches_waiting_consumer() {
        let queue = RendezvousQueue::new();
        let mut consumer = task::spawn(queue.dequeue(std::future::pending()));
        assert_pending!(consumer.poll());
        assert_eq!(queue.try_enqueue(9), Ok(()));
        assert_eq!(assert_ready!(consumer.poll()).ok(), Some(9));
    }

    #[tokio::test]
    async fn blocking_enqueue_waits_for_claim() {
        let queue = RendezvousQueue::new();
        let mut producer = task::spawn(queue.enqueue(7, std::future::pending()));
        assert_pending!(producer.poll());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.try_dequeue(), Some(7));
        assert!(producer.is_woken());
        assert!(assert_ready!(producer.poll()).is_ok());
    }

    #[tokio::test]
    async fn cancelled_enqueue_returns_value() {
        let queue = RendezvousQueue::new();
        let token = CancellationToken::new();
        let mut producer = task::spawn(queue.enqueue(7, token.cancelled()));
        assert_pending!(producer.poll());

        token.cancel();
        let result = assert_ready!(producer.poll());
        assert_eq!(result.map_err(Unclaimed::into_inner), Err(7));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dropped_enqueue_withdraws_value() {
        let queue = RendezvousQueue::new();
        {
            let mut producer = task::spawn(queue.enqueue(7, std::future::pending()));
            assert_pending!(producer.poll());
            assert_eq!(queue.len(), 1);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn cancelled_dequeue_does_not_swallow_later_value() {
        let queue = RendezvousQueue::new();
        let token = CancellationToken::new();
        let mut first = task::spawn(queue.dequeue(token.cancelled()));
        assert_pending!(first.poll());

        token.cancel();
        assert!(assert_ready!(first.poll()).is_err());
        assert_eq!(queue.waiting_consumers(), 0);

        queue.push(42);
        assert_eq!(queue.dequeue(std::future::pending()).await.ok(), Some(42));
    }

    #[tokio::test]
    async fn matched_then_cancelled_dequeue_keeps_value() {
        let queue = RendezvousQueue::new();
        let token = CancellationToken::new();
        let mut consumer = task::spawn(queue.dequeue(token.cancelled()));
        assert_pending!(consumer.poll());

        // producer matches, then cancellation fires before the consumer runs
        queue.push(1);
        token.cancel();
        assert_eq!(assert_ready!(consumer.poll()).ok(), Some(1));
    }

    #[tokio::test]
    async fn dropped_after_match_requeues_at_front() {
        let queue = RendezvousQueue::new();
        {
            let mut consumer = task::spawn(queue.dequeue(std::future::pending()));
            assert_pending!(consumer.poll());
            queue.push(1);
        }
        queue.push(2);
        assert_eq!(queue.try_dequeue(), Some(1));
        assert_eq!(queue.try_dequeue(), Some(2));
    }

    #[tokio::test]
    async fn dropped_after_match_hands_to_next_consumer() {
        let queue = RendezvousQueue::new();
        let mut second = task::spawn(queue.dequeue(std::future::pending()));
        {
            let mut first = task::spawn(queue.dequeue(std::future::pending()));
            assert_pending!(first.poll());
            assert_pending!(second.poll());
            queue.push(1);
        }
        // first claimed the value; dropping it re-offers it to the next consumer
        assert_eq!(assert_ready!(second.poll()).ok(), Some(1));
    }

    #[tokio::test]
    async fn peek_waits_without_claiming() {
        let queue = RendezvousQueue::new();
        let mut peeker = task::spawn(queue.peek(std::future::pending()));
        assert_pending!(peeker.poll());

        queue.push(3);
        assert!(peeker.is_woken());
        assert_eq!(assert_ready!(peeker.poll()).ok(), Some(3));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_with(|v| v * 2), Some(6));
    }

    #[tokio::test]
    async fn clear_releases_blocked_producers() {
        let queue = RendezvousQueue::new();
        let mut producer = task::spawn(queue.enqueue(1, std::future::pending()));
        assert_pending!(producer.poll());
        assert_eq!(queue.clear(), 1);
        assert!(assert_ready!(producer.poll()).is_ok());
    }

    fn exactly_once(producers: usize, consumers: usize) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .expect("runtime");

        runtime.block_on(async move {
            let queue = Arc::new(RendezvousQueue::new());
            let token = CancellationToken::new();

            let producer_tasks: Vec<_> = (0..producers)
                .map(|value| {
                    let queue = queue.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        queue
                            .enqueue(value, token.cancelled())
                            .await
                            .err()
                            .map(Unclaimed::into_inner)
                    })
                })
                .collect();

            let consumer_tasks: Vec<_> = (0..consumers)
                .map(|_| {
                    let queue = queue.clone();
                    let token = token.clone();
                    tokio::spawn(async move { queue.dequeue(token.cancelled()).await.ok() })
                })
                .collect();

            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();

            let mut seen: BTreeMap<usize, usize> = BTreeMap::new();
            for handle in consumer_tasks {
                if let Some(value) = handle.await.expect("consumer") {
                    *seen.entry(value).or_default() += 1;
                }
            }
            for handle in producer_tasks {
                if let Some(value) = handle.await.expect("producer") {
                    *seen.entry(value).or_default() += 1;
                }
            }
            while let Some(value) = queue.try_dequeue() {
                *seen.entry(value).or_default() += 1;
            }

            assert_eq!(seen.len(), producers, "every value accounted for");
            assert!(seen.values().all(|count| *count == 1), "{seen:?}");
        });
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn every_value_is_delivered_exactly_once(producers in 0usize..40, consumers in 0usize..40) {
            exactly_once(producers, consumers);
        }
    }

    #[test]
    fn futures_are_send() {
        fn assert_send<F: Send>(_: F) {}
        let queue: RendezvousQueue<String> = RendezvousQueue::new();
        assert_send(queue.dequeue(std::future::pending()));
        assert_send(queue.enqueue(String::new(), std::future::pending()).boxed());
    }
}
