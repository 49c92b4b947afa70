// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! The bidirectional byte-stream state machine.
//!
//! A [`Stream`] is one half of a pipe pair. The two halves share a pair of
//! rendezvous channels: bytes only move when a reader and a writer meet, and
//! every accepted transfer is acknowledged back to the writer with the number
//! of bytes actually consumed. There is no buffer in between -- a writer that
//! has not been acknowledged has not delivered anything, which is how
//! backpressure propagates.
//!
//! # Cancellation
//!
//! [`Stream::read`] and [`Stream::write`] are interrupted by deadlines, by
//! either side closing or resetting, and by the peer going away; no call
//! blocks forever. Dropping a pending `read`/`write` future is *not* a
//! supported way to cancel an operation -- arm a deadline instead.

use std::{fmt, io};

use bytes::{Buf as _, Bytes};
use futures::lock::Mutex;
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{self, Instant},
};

use crate::sync::Signal;

/// Operation a stream error occurred in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Terminal condition decorated into reset and deadline errors.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Cause {
    #[error("stream reset")]
    Reset,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Payload of decorated stream errors.
///
/// Closed-pipe and EOF are surfaced bare (a bare [`io::ErrorKind::BrokenPipe`]
/// and `Ok(0)` respectively) so callers can match them exactly; everything
/// else carries the operation and the `pipe` transport tag.
#[derive(Debug, Error)]
#[error("{op} pipe: {source}")]
pub struct OpError {
    pub op: Op,
    #[source]
    pub source: Cause,
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "closed pipe")
}

fn op_error(op: Op, source: Cause) -> io::Error {
    let kind = match source {
        Cause::Reset => io::ErrorKind::ConnectionReset,
        Cause::DeadlineExceeded => io::ErrorKind::TimedOut,
    };
    io::Error::new(kind, OpError { op, source })
}

enum Fault {
    Closed,
    Eof,
    Reset,
    DeadlineExceeded,
}

/// One direction's deadline.
///
/// Disarmed by default; arming with an instant in the past expires promptly,
/// including for operations already in flight. Expiry is observed through
/// [`Deadline::expired`], which tracks re-arms while pending.
#[derive(Debug)]
struct Deadline {
    tx: watch::Sender<Option<Instant>>,
    rx: watch::Receiver<Option<Instant>>,
}

impl Deadline {
    fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx, rx }
    }

    /// Arm at `at`, or disarm with `None`. Replaces any previous arming.
    fn set(&self, at: Option<Instant>) {
        let _ = self.tx.send(at);
    }

    fn is_expired(&self) -> bool {
        matches!(*self.rx.borrow(), Some(at) if at <= Instant::now())
    }

    async fn expired(&self) {
        let mut rx = self.rx.clone();
        loop {
            let armed = *rx.borrow_and_update();
            match armed {
                Some(at) => tokio::select! {
                    _ = time::sleep_until(at) => return,
                    res = rx.changed() => {
                        if res.is_err() {
                            std::future::pending::<()>().await
                        }
                    },
                },
                None => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await
                    }
                },
            }
        }
    }
}

/// One half of a pipe pair.
pub struct Stream {
    /// Serialises writes, so a multi-chunk write is not interleaved with
    /// another writer's bytes.
    wr_mu: Mutex<()>,

    /// Bytes from the peer's writer. Every successful receive is followed by
    /// an acknowledgment on `rd_tx`.
    rd_rx: flume::Receiver<Bytes>,
    rd_tx: flume::Sender<usize>,

    /// Bytes to the peer's reader. Every accepted transfer is followed by an
    /// acknowledgment on `wr_rx`.
    wr_tx: flume::Sender<Bytes>,
    wr_rx: flume::Receiver<usize>,

    local_done: Signal,
    local_read_done: Signal,
    local_write_done: Signal,
    local_reset: Signal,

    remote_done: Signal,
    remote_read_done: Signal,
    remote_write_done: Signal,
    remote_reset: Signal,

    read_deadline: Deadline,
    write_deadline: Deadline,
}

/// Construct a connected pair of mirror halves.
pub(crate) fn pipe() -> (Stream, Stream) {
    let (byte_tx_a, byte_rx_a) = flume::bounded::<Bytes>(0);
    let (byte_tx_b, byte_rx_b) = flume::bounded::<Bytes>(0);
    // The ack channels have room for one in-flight count, but an ack is only
    // ever sent at a point where the peer is already parked waiting for it.
    let (ack_tx_a, ack_rx_a) = flume::bounded::<usize>(1);
    let (ack_tx_b, ack_rx_b) = flume::bounded::<usize>(1);

    let done_a = Signal::new();
    let done_b = Signal::new();
    let read_done_a = Signal::new();
    let read_done_b = Signal::new();
    let write_done_a = Signal::new();
    let write_done_b = Signal::new();
    let reset_a = Signal::new();
    let reset_b = Signal::new();

    let a = Stream {
        wr_mu: Mutex::new(()),
        rd_rx: byte_rx_a,
        rd_tx: ack_tx_a,
        wr_tx: byte_tx_b,
        wr_rx: ack_rx_b,
        local_done: done_a.clone(),
        local_read_done: read_done_a.clone(),
        local_write_done: write_done_a.clone(),
        local_reset: reset_a.clone(),
        remote_done: done_b.clone(),
        remote_read_done: read_done_b.clone(),
        remote_write_done: write_done_b.clone(),
        remote_reset: reset_b.clone(),
        read_deadline: Deadline::new(),
        write_deadline: Deadline::new(),
    };
    let b = Stream {
        wr_mu: Mutex::new(()),
        rd_rx: byte_rx_b,
        rd_tx: ack_tx_b,
        wr_tx: byte_tx_a,
        wr_rx: ack_rx_a,
        local_done: done_b,
        local_read_done: read_done_b,
        local_write_done: write_done_b,
        local_reset: reset_b,
        remote_done: done_a,
        remote_read_done: read_done_a,
        remote_write_done: write_done_a,
        remote_reset: reset_a,
        read_deadline: Deadline::new(),
        write_deadline: Deadline::new(),
    };

    (a, b)
}

impl Stream {
    /// Read up to `buf.len()` bytes from the peer.
    ///
    /// `Ok(0)` is end-of-file: the peer closed, or half-closed its write
    /// side. Reading after the local [`Stream::close`] is a bare
    /// [`io::ErrorKind::BrokenPipe`]; a reset from either side is
    /// [`io::ErrorKind::ConnectionReset`]; an expired read deadline is
    /// [`io::ErrorKind::TimedOut`].
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_inner(buf).await {
            Ok(n) => Ok(n),
            Err(Fault::Eof) => Ok(0),
            Err(Fault::Closed) => Err(closed_pipe()),
            Err(Fault::Reset) => Err(op_error(Op::Read, Cause::Reset)),
            Err(Fault::DeadlineExceeded) => Err(op_error(Op::Read, Cause::DeadlineExceeded)),
        }
    }

    async fn read_inner(&self, buf: &mut [u8]) -> Result<usize, Fault> {
        if self.local_done.is_fired() {
            return Err(Fault::Closed);
        }
        if self.local_read_done.is_fired()
            || self.local_reset.is_fired()
            || self.remote_reset.is_fired()
        {
            return Err(Fault::Reset);
        }
        if self.remote_done.is_fired() || self.remote_write_done.is_fired() {
            return Err(Fault::Eof);
        }
        if self.read_deadline.is_expired() {
            return Err(Fault::DeadlineExceeded);
        }

        tokio::select! {
            res = self.rd_rx.recv_async() => match res {
                Ok(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    // Guaranteed to proceed: the peer's writer is parked
                    // waiting for exactly this acknowledgment.
                    let _ = self.rd_tx.try_send(n);
                    Ok(n)
                },
                Err(_) => self.eof_unless_reset(),
            },
            _ = self.local_done.fired() => Err(Fault::Closed),
            _ = self.remote_done.fired() => self.eof_unless_reset(),
            _ = self.remote_write_done.fired() => self.eof_unless_reset(),
            _ = self.local_reset.fired() => Err(Fault::Reset),
            _ = self.remote_reset.fired() => Err(Fault::Reset),
            _ = self.read_deadline.expired() => Err(Fault::DeadlineExceeded),
        }
    }

    /// Reset takes precedence over EOF, also when both became observable
    /// while blocked.
    fn eof_unless_reset(&self) -> Result<usize, Fault> {
        if self.local_reset.is_fired() || self.remote_reset.is_fired() {
            Err(Fault::Reset)
        } else {
            Err(Fault::Eof)
        }
    }

    /// Write `buf` to the peer.
    ///
    /// Blocks until the peer has consumed (and acknowledged) the bytes; a
    /// short write only occurs when the stream reaches a terminal state
    /// midway, in which case the count of bytes transferred so far is
    /// returned and the terminal error surfaces on the next call. Writing
    /// after either side closed is a bare [`io::ErrorKind::BrokenPipe`]; a
    /// reset (or the peer half-closing its read side) is
    /// [`io::ErrorKind::ConnectionReset`]; an expired write deadline is
    /// [`io::ErrorKind::TimedOut`].
    ///
    /// A zero-length write still observes deadlines and closures.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let (n, fault) = self.write_inner(buf).await;
        match fault {
            None => Ok(n),
            Some(Fault::Reset) => Err(op_error(Op::Write, Cause::Reset)),
            Some(_) if n > 0 => Ok(n),
            Some(Fault::DeadlineExceeded) => Err(op_error(Op::Write, Cause::DeadlineExceeded)),
            Some(_) => Err(closed_pipe()),
        }
    }

    async fn write_inner(&self, buf: &[u8]) -> (usize, Option<Fault>) {
        if self.local_done.is_fired() || self.remote_done.is_fired() {
            return (0, Some(Fault::Closed));
        }
        if self.remote_read_done.is_fired()
            || self.local_reset.is_fired()
            || self.remote_reset.is_fired()
        {
            return (0, Some(Fault::Reset));
        }
        if self.write_deadline.is_expired() {
            return (0, Some(Fault::DeadlineExceeded));
        }

        let _serialised = self.wr_mu.lock().await;

        let mut chunk = Bytes::copy_from_slice(buf);
        let mut n = 0;
        let mut first = true;
        while first || !chunk.is_empty() {
            first = false;
            tokio::select! {
                res = self.wr_tx.send_async(chunk.clone()) => match res {
                    Ok(()) => {
                        // The rendezvous completed, so the peer's reader is
                        // committed to acknowledging before it returns.
                        match self.wr_rx.recv_async().await {
                            Ok(accepted) => {
                                chunk.advance(accepted);
                                n += accepted;
                            },
                            Err(_) => return (n, Some(Fault::Closed)),
                        }
                    },
                    Err(_) => return (n, Some(Fault::Closed)),
                },
                _ = self.local_done.fired() => return (n, Some(Fault::Closed)),
                _ = self.remote_done.fired() => return (n, Some(Fault::Closed)),
                _ = self.local_reset.fired() => return (0, Some(Fault::Reset)),
                _ = self.remote_reset.fired() => return (0, Some(Fault::Reset)),
                _ = self.remote_read_done.fired() => return (0, Some(Fault::Reset)),
                _ = self.write_deadline.expired() => return (n, Some(Fault::DeadlineExceeded)),
            }
        }

        (n, None)
    }

    /// Close the stream.
    ///
    /// Future reads and writes on this half fail with closed-pipe; the peer
    /// reads EOF and its writes fail with closed-pipe. In-progress operations
    /// on both halves are interrupted.
    pub fn close(&self) {
        self.local_done.fire();
    }

    /// Close the stream for writing, leaving it open for reading.
    ///
    /// The peer's reader sees EOF after draining any in-flight transfer.
    /// Does not release the stream: callers still close or reset it.
    pub fn close_write(&self) {
        self.local_write_done.fire();
    }

    /// Close the stream for reading, leaving it open for writing.
    ///
    /// The local reader returns reset thereafter, and so does the peer's
    /// writer. Does not release the stream: callers still close or reset it.
    pub fn close_read(&self) {
        self.local_read_done.fire();
    }

    /// Abort both directions.
    ///
    /// Readers and writers on both halves surface reset, which takes
    /// precedence over EOF.
    pub fn reset(&self) {
        self.local_reset.fire();
    }

    /// Set both the read and the write deadline.
    ///
    /// A deadline in the future arms a timer; one in the past expires
    /// in-flight and subsequent operations promptly; `None` disarms. Errors
    /// with closed-pipe if the stream is closed.
    pub fn set_deadline(&self, at: Option<Instant>) -> io::Result<()> {
        self.deadline_guard()?;
        self.read_deadline.set(at);
        self.write_deadline.set(at);
        Ok(())
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) -> io::Result<()> {
        self.deadline_guard()?;
        self.read_deadline.set(at);
        Ok(())
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) -> io::Result<()> {
        self.deadline_guard()?;
        self.write_deadline.set(at);
        Ok(())
    }

    fn deadline_guard(&self) -> io::Result<()> {
        if self.local_done.is_fired() || self.remote_done.is_fired() {
            return Err(closed_pipe());
        }
        Ok(())
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stream")
            .field("closed", &self.local_done.is_fired())
            .field("reset", &self.local_reset.is_fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{sync::Arc, time::Duration};

    use futures::join;

    async fn read_all(s: &Stream) -> io::Result<Vec<u8>> {
        let mut buf = [0u8; 32];
        let mut out = Vec::new();
        loop {
            let n = s.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn transfer() {
        let (a, b) = pipe();

        let (written, received) = join!(
            async {
                let n = a.write(b"hello, world!").await?;
                a.close();
                Ok::<_, io::Error>(n)
            },
            read_all(&b),
        );

        assert_eq!(written.unwrap(), 13);
        assert_eq!(received.unwrap(), b"hello, world!")
    }

    #[tokio::test]
    async fn large_write_through_small_reads() {
        let (a, b) = pipe();
        let payload = (0..=255u8).cycle().take(4096).collect::<Vec<_>>();

        let (written, received) = join!(
            async {
                let n = a.write(&payload).await?;
                a.close_write();
                Ok::<_, io::Error>(n)
            },
            read_all(&b),
        );

        assert_eq!(written.unwrap(), payload.len());
        assert_eq!(received.unwrap(), payload)
    }

    #[tokio::test]
    async fn concurrent_writes_do_not_interleave() {
        let (a, b) = pipe();
        let a = Arc::new(a);

        let wa = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.write(&[b'x'; 512]).await })
        };
        let wb = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.write(&[b'y'; 512]).await })
        };

        let received = {
            let mut out = Vec::new();
            let mut buf = [0u8; 100];
            while out.len() < 1024 {
                let n = b.read(&mut buf).await.unwrap();
                out.extend_from_slice(&buf[..n]);
            }
            out
        };
        assert_eq!(wa.await.unwrap().unwrap(), 512);
        assert_eq!(wb.await.unwrap().unwrap(), 512);

        // Whichever write went first, its bytes are contiguous.
        let expect_xy: Vec<u8> = [[b'x'; 512], [b'y'; 512]].concat();
        let expect_yx: Vec<u8> = [[b'y'; 512], [b'x'; 512]].concat();
        assert!(received == expect_xy || received == expect_yx)
    }

    #[tokio::test]
    async fn eof_after_close_write() {
        let (a, b) = pipe();
        a.close_write();

        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);

        // The write direction b -> a is unaffected.
        let (written, received) = join!(b.write(b"ok"), async {
            let mut buf = [0u8; 2];
            a.read(&mut buf).await.map(|n| buf[..n].to_vec())
        });
        assert_eq!(written.unwrap(), 2);
        assert_eq!(received.unwrap(), b"ok")
    }

    #[tokio::test]
    async fn reset_wins_against_eof() {
        let (a, b) = pipe();
        a.close_write();
        a.reset();

        let mut buf = [0u8; 1];
        let err = b.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset)
    }

    #[tokio::test]
    async fn reset_is_seen_by_both_directions() {
        let (a, b) = pipe();
        a.reset();

        let mut buf = [0u8; 1];
        assert_eq!(
            b.read(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
        assert_eq!(
            b.write(&[0]).await.unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
        assert_eq!(
            a.read(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
        assert_eq!(
            a.write(&[0]).await.unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        )
    }

    #[tokio::test]
    async fn close_read_resets_peer_writes() {
        let (a, b) = pipe();
        b.close_read();

        let mut buf = [0u8; 1];
        assert_eq!(
            b.read(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
        assert_eq!(
            a.write(&[0]).await.unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        )
    }

    #[tokio::test]
    async fn close_is_terminal_on_both_halves() {
        let (a, b) = pipe();
        a.close();

        let mut buf = [0u8; 1];
        assert_eq!(
            a.read(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        assert_eq!(
            a.write(&[0]).await.unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        // The peer reads EOF and cannot write.
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
        assert_eq!(
            b.write(&[0]).await.unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        )
    }

    #[tokio::test]
    async fn close_interrupts_blocked_ops() {
        let (a, b) = pipe();
        let b = Arc::new(b);

        let blocked = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                let mut buf = [0u8; 1];
                b.read(&mut buf).await
            })
        };

        tokio::task::yield_now().await;
        a.close();

        assert_eq!(blocked.await.unwrap().unwrap(), 0)
    }

    #[tokio::test]
    async fn past_read_deadline_expires_promptly() {
        let (a, _b) = pipe();
        a.set_read_deadline(Some(Instant::now() - Duration::from_secs(1)))
            .unwrap();

        let mut buf = [0u8; 1];
        let err = a.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut)
    }

    #[tokio::test]
    async fn deadline_interrupts_pending_read() {
        let (a, _b) = pipe();
        let a = Arc::new(a);

        let pending = {
            let a = Arc::clone(&a);
            tokio::spawn(async move {
                let mut buf = [0u8; 1];
                a.read(&mut buf).await
            })
        };

        tokio::task::yield_now().await;
        a.set_read_deadline(Some(Instant::now() - Duration::from_millis(1)))
            .unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut)
    }

    #[tokio::test]
    async fn zero_deadline_disarms() {
        let (a, b) = pipe();
        a.set_read_deadline(Some(Instant::now() - Duration::from_secs(1)))
            .unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(
            a.read(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );

        a.set_read_deadline(None).unwrap();
        let (written, received) = join!(b.write(b"ok"), async {
            a.read(&mut buf).await.map(|n| buf[..n].to_vec())
        });
        assert_eq!(written.unwrap(), 2);
        assert_eq!(received.unwrap(), b"ok")
    }

    #[tokio::test]
    async fn zero_length_write_observes_deadline() {
        let (a, _b) = pipe();
        a.set_write_deadline(Some(Instant::now() - Duration::from_secs(1)))
            .unwrap();

        let err = a.write(&[]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut)
    }

    #[tokio::test]
    async fn deadline_on_closed_pipe_is_an_error() {
        let (a, _b) = pipe();
        a.close();

        let err = a.set_deadline(None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe)
    }

    #[tokio::test]
    async fn dropped_peer_acts_like_close() {
        let (a, b) = pipe();
        drop(b);

        let mut buf = [0u8; 1];
        assert_eq!(a.read(&mut buf).await.unwrap(), 0);
        assert_eq!(
            a.write(&[0]).await.unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        )
    }

    #[tokio::test]
    async fn reset_error_is_decorated() {
        let (a, b) = pipe();
        a.reset();

        let mut buf = [0u8; 1];
        let err = b.read(&mut buf).await.unwrap_err();
        assert_eq!(err.to_string(), "read pipe: stream reset");

        let err = b.write(&[0]).await.unwrap_err();
        assert_eq!(err.to_string(), "write pipe: stream reset")
    }
}
