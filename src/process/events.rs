//! Lifecycle event channels
//!
//! Single-threaded MPSC channel: a RefCell-wrapped VecDeque plus the waker of
//! whoever is parked on `recv()`. A process handle owns the senders and
//! closes them after its final event.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Create a new channel pair
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Rc::new(RefCell::new(ChannelInner {
        queue: VecDeque::new(),
        closed: false,
        waker: None,
    }));

    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

struct ChannelInner<T> {
    queue: VecDeque<T>,
    closed: bool,
    waker: Option<Waker>,
}

impl<T> ChannelInner<T> {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Sending half of a channel
pub struct Sender<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

impl<T> Sender<T> {
    /// Send a value into the channel
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(SendError(value));
        }
        inner.queue.push_back(value);
        inner.wake();
        Ok(())
    }

    /// Close the sending side; queued values stay receivable
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        inner.wake();
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Receiving half of a channel
pub struct Receiver<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

impl<T> Receiver<T> {
    /// Try to receive a value without blocking
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.inner.borrow_mut();
        match inner.queue.pop_front() {
            Some(value) => Ok(value),
            None if inner.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Receive a value, parking until one arrives. `None` once closed and drained.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture { receiver: self }
    }

    /// Drain everything currently queued
    pub fn drain(&self) -> Vec<T> {
        self.inner.borrow_mut().queue.drain(..).collect()
    }
}

/// Future for async receive
pub struct RecvFuture<'a, T> {
    receiver: &'a Receiver<T>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.receiver.inner.borrow_mut();
        match inner.queue.pop_front() {
            Some(value) => Poll::Ready(Some(value)),
            None if inner.closed => Poll::Ready(None),
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Error when sending fails
#[derive(Debug)]
pub struct SendError<T>(pub T);

/// Error when try_recv fails
#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;
    use std::cell::Cell;

    #[test]
    fn test_send_receive() {
        let (tx, rx) = channel::<i32>();

        tx.send(42).unwrap();
        tx.send(43).unwrap();

        assert_eq!(rx.try_recv(), Ok(42));
        assert_eq!(rx.try_recv(), Ok(43));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_closed_channel() {
        let (tx, rx) = channel::<i32>();

        tx.send(1).unwrap();
        tx.close();

        // Can still receive what was sent before close
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn test_send_after_close_fails() {
        let (tx, _rx) = channel::<i32>();

        tx.close();
        let result = tx.send(42);

        assert!(result.is_err());
        assert_eq!(result.unwrap_err().0, 42);
    }

    #[test]
    fn test_recv_wakes_on_send() {
        let mut pool = LocalPool::new();
        let (tx, rx) = channel::<&'static str>();
        let got = Rc::new(Cell::new(None));

        let sink = got.clone();
        pool.spawner()
            .spawn_local(async move {
                sink.set(rx.recv().await);
            })
            .unwrap();

        // Receiver parks with nothing queued
        pool.run_until_stalled();
        assert_eq!(got.get(), None);

        tx.send("spawn").unwrap();
        pool.run_until_stalled();
        assert_eq!(got.get(), Some("spawn"));
    }

    #[test]
    fn test_recv_ends_on_close() {
        let mut pool = LocalPool::new();
        let (tx, rx) = channel::<u8>();
        let ended = Rc::new(Cell::new(false));

        let flag = ended.clone();
        pool.spawner()
            .spawn_local(async move {
                assert_eq!(rx.recv().await, None);
                flag.set(true);
            })
            .unwrap();

        pool.run_until_stalled();
        assert!(!ended.get());
        tx.close();
        pool.run_until_stalled();
        assert!(ended.get());
    }

    #[test]
    fn test_fifo_order_and_drain() {
        let (tx, rx) = channel::<i32>();
        for i in 0..10 {
            tx.send(i).unwrap();
        }
        assert_eq!(rx.drain(), (0..10).collect::<Vec<_>>());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }
}
