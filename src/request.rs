// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Transfer requests and completion tokens.
//!
//! A [`Request`] owns its scatter-gather list until it completes. Submitting
//! returns a [`CompletionToken`]; the engine signals it (and runs the
//! request's callback, if any) once hardware is done, always outside the
//! queue lock.

use crate::dma::DmaBuffer;
use crate::error::{QdmaError, QdmaResult};
use crate::lock;
use crate::queue::Direction;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Completion callback, run once with the request's result.
pub type Callback = Box<dyn FnOnce(&QdmaResult<Completion>) + Send + 'static>;

/// One contiguous piece of a transfer.
#[derive(Debug, Clone)]
pub struct SgEntry {
    pub buf: DmaBuffer,
    pub offset: usize,
    pub len: usize,
}

impl SgEntry {
    /// `len` bytes of `buf` starting at `offset`.
    pub fn new(buf: DmaBuffer, offset: usize, len: usize) -> Self {
        let offset = offset.min(buf.len());
        let len = len.min(buf.len() - offset);
        Self { buf, offset, len }
    }

    /// The whole of `buf`.
    pub fn whole(buf: DmaBuffer) -> Self {
        let len = buf.len();
        Self {
            buf,
            offset: 0,
            len,
        }
    }

    /// Bus address of the first byte.
    pub fn bus_addr(&self) -> u64 {
        self.buf.bus_addr() + self.offset as u64
    }
}

/// A transfer request.
pub struct Request {
    pub(crate) sgl: Vec<SgEntry>,
    pub(crate) ep_addr: u64,
    pub(crate) eot: bool,
    pub(crate) direction: Option<Direction>,
    pub(crate) callback: Option<Callback>,
    len: usize,
}

impl Request {
    /// Request over `sgl`, valid for either direction.
    pub fn new(sgl: Vec<SgEntry>) -> Self {
        let len = sgl.iter().map(|sg| sg.len).sum();
        Self {
            sgl,
            ep_addr: 0,
            eot: true,
            direction: None,
            callback: None,
            len,
        }
    }

    /// Request over a single whole buffer.
    pub fn from_buffer(buf: &DmaBuffer) -> Self {
        Self::new(vec![SgEntry::whole(buf.clone())])
    }

    /// Host-to-card request; submitting it to a C2H queue fails.
    pub fn write(sgl: Vec<SgEntry>) -> Self {
        Self {
            direction: Some(Direction::H2c),
            ..Self::new(sgl)
        }
    }

    /// Card-to-host request; submitting it to an H2C queue fails.
    pub fn read(sgl: Vec<SgEntry>) -> Self {
        Self {
            direction: Some(Direction::C2h),
            ..Self::new(sgl)
        }
    }

    /// Card address for memory-mapped transfers.
    pub fn with_ep_addr(mut self, ep_addr: u64) -> Self {
        self.ep_addr = ep_addr;
        self
    }

    /// End-of-packet semantics.
    ///
    /// Streaming H2C: mark the last descriptor end-of-packet.
    /// Streaming C2H: complete at the packet end, and fail with
    /// [`QdmaError::Incomplete`] when the packet overflows the request.
    /// Defaults to `true`.
    pub fn with_eot(mut self, eot: bool) -> Self {
        self.eot = eot;
        self
    }

    /// Run `f` with the result when the request completes.
    pub fn with_callback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&QdmaResult<Completion>) + Send + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }

    /// Total bytes across the scatter-gather list.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ep_addr(&self) -> u64 {
        self.ep_addr
    }

    pub fn eot(&self) -> bool {
        self.eot
    }

    pub fn sgl(&self) -> &[SgEntry] {
        &self.sgl
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("len", &self.len)
            .field("fragments", &self.sgl.len())
            .field("ep_addr", &format_args!("{:#x}", self.ep_addr))
            .field("eot", &self.eot)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Outcome of a successful request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Bytes moved.
    pub bytes: usize,
    /// Receive ended on an end-of-transfer completion.
    pub eot: bool,
    /// Time from submission to completion.
    pub latency: Duration,
}

struct TokenState {
    done: bool,
    result: Option<QdmaResult<Completion>>,
}

pub(crate) struct TokenShared {
    state: Mutex<TokenState>,
    cv: Condvar,
    canceled: AtomicBool,
    #[cfg(feature = "async")]
    done_tx: tokio::sync::watch::Sender<bool>,
}

impl TokenShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TokenState {
                done: false,
                result: None,
            }),
            cv: Condvar::new(),
            canceled: AtomicBool::new(false),
            #[cfg(feature = "async")]
            done_tx: tokio::sync::watch::channel(false).0,
        })
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn complete(&self, result: QdmaResult<Completion>) {
        {
            let mut state = lock(&self.state);
            state.result = Some(result);
            state.done = true;
        }
        self.cv.notify_all();
        #[cfg(feature = "async")]
        self.done_tx.send_replace(true);
    }

    fn take(&self) -> QdmaResult<Completion> {
        lock(&self.state).result.take().unwrap_or(Err(QdmaError::Canceled))
    }
}

/// Handle to a submitted request.
pub struct CompletionToken {
    shared: Arc<TokenShared>,
}

impl CompletionToken {
    pub(crate) fn new(shared: Arc<TokenShared>) -> Self {
        Self { shared }
    }

    /// True once the request completed, successfully or not.
    pub fn is_done(&self) -> bool {
        lock(&self.shared.state).done
    }

    /// Skip the request if it has not started; no effect once descriptors
    /// for it have been written or received data has landed in it.
    pub fn cancel(&self) {
        self.shared.canceled.store(true, Ordering::Release);
    }

    /// Block until the request completes.
    pub fn wait(self) -> QdmaResult<Completion> {
        let mut state = lock(&self.shared.state);
        while !state.done {
            state = self
                .shared
                .cv
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        drop(state);
        self.shared.take()
    }

    /// Block up to `timeout`; [`QdmaError::WaitTimeout`] if still running.
    pub fn wait_timeout(self, timeout: Duration) -> QdmaResult<Completion> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        while !state.done {
            let now = Instant::now();
            if now >= deadline {
                return Err(QdmaError::WaitTimeout);
            }
            state = self
                .shared
                .cv
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        drop(state);
        self.shared.take()
    }

    /// Await completion from async code.
    #[cfg(feature = "async")]
    pub async fn wait_async(self) -> QdmaResult<Completion> {
        let mut rx = self.shared.done_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
        self.shared.take()
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionToken")
            .field("done", &self.is_done())
            .finish()
    }
}

/// A request the engine has accepted, with its progress.
pub(crate) struct Pending {
    pub(crate) req: Request,
    pub(crate) shared: Arc<TokenShared>,
    /// Bytes described to hardware (send) or delivered (receive).
    pub(crate) offset: usize,
    /// Descriptors written and not yet credited back.
    pub(crate) desc_nr: u32,
    /// Receive bytes discarded after an overflow.
    pub(crate) dropped: usize,
    /// Discarding the rest of an overflowing packet.
    pub(crate) draining: bool,
    pub(crate) submitted_at: Instant,
    sg_idx: usize,
    sg_off: usize,
}

impl Pending {
    pub(crate) fn new(req: Request, shared: Arc<TokenShared>) -> Self {
        Self {
            req,
            shared,
            offset: 0,
            desc_nr: 0,
            dropped: 0,
            draining: false,
            submitted_at: Instant::now(),
            sg_idx: 0,
            sg_off: 0,
        }
    }

    #[inline]
    pub(crate) fn total(&self) -> usize {
        self.req.len
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.req.len - self.offset
    }

    /// Nothing has been written to hardware for this request yet.
    #[inline]
    pub(crate) fn unstarted(&self) -> bool {
        self.offset == 0 && self.desc_nr == 0
    }

    /// Next host chunk of at most `cap` bytes as `(bus, len)`. Advances the
    /// scatter-gather cursor but not `offset`.
    pub(crate) fn next_chunk(&mut self, cap: usize) -> Option<(u64, usize)> {
        while let Some(sg) = self.req.sgl.get(self.sg_idx) {
            let left = sg.len - self.sg_off;
            if left == 0 {
                self.sg_idx += 1;
                self.sg_off = 0;
                continue;
            }
            let n = left.min(cap);
            let bus = sg.bus_addr() + self.sg_off as u64;
            self.sg_off += n;
            return Some((bus, n));
        }
        None
    }

    /// Copy up to `len` bytes from `src[src_off..]` into the request at the
    /// cursor. Returns bytes copied and advances `offset`.
    pub(crate) fn fill_from(&mut self, src: &DmaBuffer, src_off: usize, len: usize) -> usize {
        let mut copied = 0;
        let mut scratch = Vec::new();
        while copied < len {
            let Some(sg) = self.req.sgl.get(self.sg_idx) else {
                break;
            };
            let left = sg.len - self.sg_off;
            if left == 0 {
                self.sg_idx += 1;
                self.sg_off = 0;
                continue;
            }
            let n = left.min(len - copied);
            scratch.resize(n, 0);
            src.read(src_off + copied, &mut scratch);
            sg.buf.write(sg.offset + self.sg_off, &scratch);
            self.sg_off += n;
            copied += n;
        }
        self.offset += copied;
        copied
    }
}

/// A pending request together with its outcome, ready to be signaled.
pub(crate) struct Finished {
    pending: Pending,
    result: QdmaResult<Completion>,
}

impl Finished {
    pub(crate) fn ok(pending: Pending, bytes: usize, eot: bool) -> Self {
        let latency = pending.submitted_at.elapsed();
        Self {
            pending,
            result: Ok(Completion {
                bytes,
                eot,
                latency,
            }),
        }
    }

    pub(crate) fn err(pending: Pending, err: QdmaError) -> Self {
        Self {
            pending,
            result: Err(err),
        }
    }

    /// Run the callback, then wake waiters.
    pub(crate) fn fire(self) {
        let Pending { req, shared, .. } = self.pending;
        if let Some(cb) = req.callback {
            cb(&self.result);
        }
        shared.complete(self.result);
    }
}

/// Signal every finished request, in order.
pub(crate) fn fire_all(done: Vec<Finished>) {
    for f in done {
        f.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaSpace;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_request_builders() {
        let dma = DmaSpace::new();
        let a = dma.alloc(100, "a").unwrap();
        let b = dma.alloc(50, "b").unwrap();
        let req = Request::write(vec![SgEntry::whole(a), SgEntry::new(b, 10, 100)])
            .with_ep_addr(0x4000)
            .with_eot(false);
        assert_eq!(req.len(), 140);
        assert_eq!(req.ep_addr(), 0x4000);
        assert!(!req.eot());
        assert_eq!(req.direction, Some(Direction::H2c));
        assert!(Request::new(vec![]).is_empty());
    }

    #[test]
    fn test_chunking_across_fragments() {
        let dma = DmaSpace::new();
        let a = dma.alloc(100, "a").unwrap();
        let b = dma.alloc(30, "b").unwrap();
        let req = Request::new(vec![SgEntry::whole(a.clone()), SgEntry::whole(b.clone())]);
        let mut p = Pending::new(req, TokenShared::new());

        assert_eq!(p.next_chunk(64), Some((a.bus_addr(), 64)));
        assert_eq!(p.next_chunk(64), Some((a.bus_addr() + 64, 36)));
        assert_eq!(p.next_chunk(64), Some((b.bus_addr(), 30)));
        assert_eq!(p.next_chunk(64), None);
    }

    #[test]
    fn test_fill_from_scatters() {
        let dma = DmaSpace::new();
        let src = dma.alloc(8, "src").unwrap();
        src.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let a = dma.alloc(3, "a").unwrap();
        let b = dma.alloc(10, "b").unwrap();
        let req = Request::new(vec![SgEntry::whole(a.clone()), SgEntry::whole(b.clone())]);
        let mut p = Pending::new(req, TokenShared::new());

        assert_eq!(p.fill_from(&src, 0, 5), 5);
        assert_eq!(p.fill_from(&src, 5, 3), 3);
        assert_eq!(p.offset, 8);
        assert_eq!(p.remaining(), 5);
        assert_eq!(a.to_vec(), vec![1, 2, 3]);
        assert_eq!(&b.to_vec()[..5], &[4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_token_signaling_and_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let req = Request::new(vec![]).with_callback(move |res| {
            assert!(res.is_ok());
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let shared = TokenShared::new();
        let token = CompletionToken::new(Arc::clone(&shared));
        assert!(!token.is_done());

        let pending = Pending::new(req, shared);
        let waiter = std::thread::spawn(move || token.wait());
        Finished::ok(pending, 42, true).fire();

        let done = waiter.join().unwrap().unwrap();
        assert_eq!(done.bytes, 42);
        assert!(done.eot);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_timeout() {
        let shared = TokenShared::new();
        let token = CompletionToken::new(shared);
        let err = token.wait_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, QdmaError::WaitTimeout));
    }

    #[test]
    fn test_cancel_flag() {
        let shared = TokenShared::new();
        let token = CompletionToken::new(Arc::clone(&shared));
        assert!(!shared.is_canceled());
        token.cancel();
        assert!(shared.is_canceled());
    }

    #[test]
    fn test_token_debug() {
        let shared = TokenShared::new();
        let token = CompletionToken::new(Arc::clone(&shared));
        assert_eq!(format!("{:?}", token), "CompletionToken { done: false }");
        drop(token);
        let res: QdmaResult<CompletionToken> = Err(QdmaError::Canceled);
        assert!(matches!(res.unwrap_err(), QdmaError::Canceled));
    }

    #[cfg(feature = "async")]
    #[test]
    fn test_wait_async() {
        let shared = TokenShared::new();
        let token = CompletionToken::new(Arc::clone(&shared));
        let pending = Pending::new(Request::new(vec![]), shared);
        Finished::err(pending, QdmaError::Canceled).fire();

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let res = rt.block_on(token.wait_async());
        assert!(matches!(res, Err(QdmaError::Canceled)));
    }
}
