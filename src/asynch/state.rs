use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Context, Poll};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::waitqueue::WakerRegistration;
use heapless::Vec;

/// Bytes read off the stream that no one has consumed yet.
///
/// Filled by the ingress loop of the runner, drained either by the transaction
/// that currently owns the client or by the URC dispatcher.
pub(crate) struct Ingress<M: RawMutex, const N: usize> {
    shared: Mutex<M, RefCell<Shared<N>>>,
}

struct Shared<const N: usize> {
    buf: Vec<u8, N>,
    kicked: bool,
    reader_waker: WakerRegistration,
    urc_waker: WakerRegistration,
    space_waker: WakerRegistration,
}

impl<M: RawMutex, const N: usize> Ingress<M, N> {
    pub(crate) fn new() -> Self {
        Self {
            shared: Mutex::new(RefCell::new(Shared {
                buf: Vec::new(),
                kicked: false,
                reader_waker: WakerRegistration::new(),
                urc_waker: WakerRegistration::new(),
                space_waker: WakerRegistration::new(),
            })),
        }
    }

    /// Appends all of `data`, waiting for room whenever the buffer is full.
    pub(crate) async fn push(&self, mut data: &[u8]) {
        while !data.is_empty() {
            let n = poll_fn(|cx| self.poll_push(cx, data)).await;
            data = &data[n..];
        }
    }

    fn poll_push(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<usize> {
        self.shared.lock(|s| {
            let s = &mut *s.borrow_mut();
            let room = N - s.buf.len();
            if room == 0 {
                s.space_waker.register(cx.waker());
                return Poll::Pending;
            }

            let n = room.min(data.len());
            // Cannot fail, `n` is bounded by the free capacity.
            s.buf.extend_from_slice(&data[..n]).ok();
            s.reader_waker.wake();
            s.urc_waker.wake();
            Poll::Ready(n)
        })
    }

    /// Moves whatever is buffered into `rx` without waiting.
    pub(crate) fn take_into<const R: usize>(&self, rx: &mut RxBuffer<R>) -> usize {
        self.take(None, rx)
    }

    /// Waits until at least one byte could be moved into `rx`.
    ///
    /// The caller must make sure `rx` has room, or this never completes.
    pub(crate) async fn read_into<const R: usize>(&self, rx: &mut RxBuffer<R>) -> usize {
        poll_fn(|cx| match self.take(Some(cx), rx) {
            0 => Poll::Pending,
            n => Poll::Ready(n),
        })
        .await
    }

    fn take<const R: usize>(&self, cx: Option<&mut Context<'_>>, rx: &mut RxBuffer<R>) -> usize {
        self.shared.lock(|s| {
            let s = &mut *s.borrow_mut();
            let n = rx.append(&s.buf);
            if n > 0 {
                let len = s.buf.len();
                s.buf.copy_within(n.., 0);
                s.buf.truncate(len - n);
                s.space_waker.wake();
            } else if let Some(cx) = cx {
                s.reader_waker.register(cx.waker());
            }
            n
        })
    }

    /// Completes once there are bytes for the URC dispatcher to look at.
    pub(crate) async fn wait_urc_work(&self) {
        poll_fn(|cx| {
            self.shared.lock(|s| {
                let s = &mut *s.borrow_mut();
                if !s.buf.is_empty() || s.kicked {
                    s.kicked = false;
                    return Poll::Ready(());
                }
                s.urc_waker.register(cx.waker());
                Poll::Pending
            })
        })
        .await
    }

    /// Makes the URC dispatcher look at already received bytes.
    pub(crate) fn kick(&self) {
        self.shared.lock(|s| {
            let s = &mut *s.borrow_mut();
            s.kicked = true;
            s.urc_waker.wake();
        })
    }

    pub(crate) fn clear(&self) {
        self.shared.lock(|s| {
            let s = &mut *s.borrow_mut();
            s.buf.clear();
            s.space_waker.wake();
        })
    }
}

/// Receive buffer of one client instance. Consumed bytes are reclaimed lazily.
pub(crate) struct RxBuffer<const N: usize> {
    buf: Vec<u8, N>,
    start: usize,
}

impl<const N: usize> RxBuffer<N> {
    pub(crate) const fn new() -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
        }
    }

    /// Unconsumed bytes.
    pub(crate) fn data(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start == self.buf.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() == N
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.buf.len());
        if self.start == self.buf.len() {
            self.clear();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.start = 0;
    }

    pub(crate) fn compact(&mut self) {
        if self.start > 0 {
            let len = self.buf.len();
            self.buf.copy_within(self.start.., 0);
            self.buf.truncate(len - self.start);
            self.start = 0;
        }
    }

    fn append(&mut self, data: &[u8]) -> usize {
        if N - self.buf.len() < data.len() {
            self.compact();
        }
        let n = (N - self.buf.len()).min(data.len());
        self.buf.extend_from_slice(&data[..n]).ok();
        n
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    #[test]
    fn rx_buffer_reclaims_consumed_bytes() {
        let mut rx = RxBuffer::<8>::new();
        assert_eq!(rx.append(b"abcdef"), 6);
        rx.consume(4);
        assert_eq!(rx.data(), b"ef");
        assert_eq!(rx.append(b"ghijkl"), 6);
        assert_eq!(rx.data(), b"efghijkl");
        assert!(rx.is_full());
        assert_eq!(rx.append(b"m"), 0);
        rx.consume(8);
        assert!(rx.is_empty());
    }

    #[test]
    fn ingress_hands_over_what_fits() {
        let ingress = Ingress::<NoopRawMutex, 16>::new();
        block_on(ingress.push(b"0123456789"));

        let mut rx = RxBuffer::<4>::new();
        assert_eq!(ingress.take_into(&mut rx), 4);
        assert_eq!(rx.data(), b"0123");
        rx.consume(4);
        assert_eq!(block_on(ingress.read_into(&mut rx)), 4);
        assert_eq!(rx.data(), b"4567");
    }

    #[test]
    fn kick_wakes_dispatcher_once() {
        let ingress = Ingress::<NoopRawMutex, 16>::new();
        ingress.kick();
        block_on(ingress.wait_urc_work());
        ingress.clear();
        block_on(ingress.push(b"x"));
        block_on(ingress.wait_urc_work());
    }
}
