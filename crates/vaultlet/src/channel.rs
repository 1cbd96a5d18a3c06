//! Duplex byte channel between host and worklet.
//!
//! Buffers are framed with a 4-byte length prefix so each write arrives at
//! the other side as one whole chunk. A dedicated writer task drains
//! submitted buffers in order; a reader task pumps inbound frames to waiting
//! readers in the order the reads were issued, buffering frames that arrive
//! with no waiter. Ownership of a buffer transfers on hand-off: the channel
//! retains nothing after a write completes or a read delivers.
//!
//! Closing the channel (explicitly, or because the worklet side vanished)
//! resolves every pending operation; nothing is left hanging.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Largest frame either side may produce.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Transport-level failures. Never auto-retried; retry semantics depend on
/// the caller's message idempotence.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("write failed: {0}")]
    Write(String),

    #[error("read failed: {0}")]
    Read(String),

    /// Channel torn down mid-operation. Terminal for that operation only.
    #[error("channel closed")]
    Closed,

    /// The worklet's outbound stream ended with no further data.
    #[error("worklet stream ended without further data")]
    EmptyStream,
}

/// Why the channel stopped accepting traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closure {
    Open,
    /// Clean end-of-stream from the worklet side.
    Eof,
    /// Explicit teardown or a transport fault.
    Torn,
}

struct WriteOp {
    frame: Bytes,
    ack: oneshot::Sender<Result<(), ChannelError>>,
}

struct ReadState {
    waiters: VecDeque<oneshot::Sender<Result<Bytes, ChannelError>>>,
    buffered: VecDeque<Bytes>,
    closure: Closure,
}

struct Inner {
    reads: Mutex<ReadState>,
    closed_tx: watch::Sender<bool>,
}

impl Inner {
    /// First closure wins; later calls are no-ops.
    fn seal(&self, closure: Closure) {
        let mut state = self.reads.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closure != Closure::Open {
            return;
        }
        state.closure = closure;
        let err = match closure {
            Closure::Eof => ChannelError::EmptyStream,
            _ => ChannelError::Closed,
        };
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        drop(state);
        // send_replace stores the flag even when nobody is subscribed yet.
        self.closed_tx.send_replace(true);
    }
}

/// Ordered, bidirectional chunk pipe over any async byte transport.
///
/// Writes complete in submission order; completion signals hand-off to the
/// transport, not that the worklet has processed the bytes. Concurrent reads
/// are serviced strictly in issuance order, one whole frame each.
pub struct DuplexChannel {
    inner: Arc<Inner>,
    write_tx: mpsc::UnboundedSender<WriteOp>,
}

impl DuplexChannel {
    /// Wire the channel over the given transport halves and start its pump
    /// tasks. Must be called from within a tokio runtime.
    pub fn new<R, W>(read_half: R, write_half: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = || {
            LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec()
        };

        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            reads: Mutex::new(ReadState {
                waiters: VecDeque::new(),
                buffered: VecDeque::new(),
                closure: Closure::Open,
            }),
            closed_tx,
        });

        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let sink = FramedWrite::new(write_half, codec());
        tokio::spawn(write_task(Arc::clone(&inner), write_rx, sink));

        let stream = FramedRead::new(read_half, codec());
        tokio::spawn(read_task(Arc::clone(&inner), stream));

        Arc::new(Self { inner, write_tx })
    }

    /// Transmit one buffer to the worklet's inbound stream.
    pub async fn write(&self, buffer: Bytes) -> Result<(), ChannelError> {
        match self.enqueue_write(buffer).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Closed),
        }
    }

    /// Resolve with the next whole frame from the worklet's outbound stream.
    pub async fn read(&self) -> Result<Bytes, ChannelError> {
        match self.enqueue_read().await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Closed),
        }
    }

    /// Queue a write and return its completion slot without awaiting it.
    pub(crate) fn enqueue_write(
        &self,
        frame: Bytes,
    ) -> oneshot::Receiver<Result<(), ChannelError>> {
        let (ack, rx) = oneshot::channel();

        if frame.len() > MAX_FRAME_BYTES {
            let _ = ack.send(Err(ChannelError::Write(format!(
                "frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                MAX_FRAME_BYTES
            ))));
            return rx;
        }

        if self.is_closed() {
            let _ = ack.send(Err(ChannelError::Closed));
            return rx;
        }

        if let Err(rejected) = self.write_tx.send(WriteOp { frame, ack }) {
            let _ = rejected.0.ack.send(Err(ChannelError::Closed));
        }
        rx
    }

    /// Register a read waiter (or resolve it immediately from the buffer)
    /// and return its completion slot without awaiting it.
    pub(crate) fn enqueue_read(&self) -> oneshot::Receiver<Result<Bytes, ChannelError>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self
            .inner
            .reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(frame) = state.buffered.pop_front() {
            let _ = tx.send(Ok(frame));
            return rx;
        }

        match state.closure {
            Closure::Open => state.waiters.push_back(tx),
            Closure::Eof => {
                let _ = tx.send(Err(ChannelError::EmptyStream));
            }
            Closure::Torn => {
                let _ = tx.send(Err(ChannelError::Closed));
            }
        }
        rx
    }

    /// Tear the channel down. All pending writes and reads resolve with
    /// [`ChannelError::Closed`]. Idempotent.
    pub fn close(&self) {
        tracing::debug!("Closing duplex channel");
        self.inner.seal(Closure::Torn);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Observer that flips to `true` once the channel has closed for any
    /// reason (teardown, transport fault, or worklet exit).
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }
}

async fn write_task<W>(
    inner: Arc<Inner>,
    mut write_rx: mpsc::UnboundedReceiver<WriteOp>,
    mut sink: FramedWrite<W, LengthDelimitedCodec>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut closed_rx = inner.closed_tx.subscribe();

    loop {
        let op = tokio::select! {
            biased;
            _ = closed_rx.changed() => break,
            op = write_rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let WriteOp { frame, ack } = op;
        let result = tokio::select! {
            biased;
            _ = closed_rx.changed() => Err(ChannelError::Closed),
            sent = sink.send(frame) => {
                sent.map_err(|e| ChannelError::Write(e.to_string()))
            }
        };

        let failed = result.is_err();
        if let Err(ref e) = result {
            tracing::warn!(error = %e, "Channel write failed");
        }
        let _ = ack.send(result);

        if failed {
            // A rejected write means the transport is gone; reads must not
            // keep waiting on a dead pipe.
            inner.seal(Closure::Torn);
            break;
        }
    }

    // Resolve anything still queued so no completion is left uninvoked.
    write_rx.close();
    while let Ok(op) = write_rx.try_recv() {
        let _ = op.ack.send(Err(ChannelError::Closed));
    }
    tracing::trace!("Channel writer exiting");
}

async fn read_task<R>(inner: Arc<Inner>, mut stream: FramedRead<R, LengthDelimitedCodec>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        match stream.next().await {
            Some(Ok(frame)) => {
                let mut frame = frame.freeze();
                let mut state = inner.reads.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closure != Closure::Open {
                    break;
                }
                // Deliver to the oldest live waiter; a dropped waiter (caller
                // gave up on the read) forfeits its place in line.
                loop {
                    match state.waiters.pop_front() {
                        Some(waiter) => match waiter.send(Ok(frame)) {
                            Ok(()) => break,
                            Err(Ok(returned)) => frame = returned,
                            Err(Err(_)) => break,
                        },
                        None => {
                            state.buffered.push_back(frame);
                            break;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Channel read failed");
                inner.seal(Closure::Torn);
                break;
            }
            None => {
                tracing::debug!("Worklet outbound stream ended");
                inner.seal(Closure::Eof);
                break;
            }
        }
    }
    tracing::trace!("Channel reader exiting");
}
