//! Request/reply gateway layered on the duplex channel.
//!
//! Correlation is strictly by order: no identifiers are embedded in the
//! payload, so the worklet-side contract must answer requests in the order
//! they were sent. The gateway enqueues the outgoing write and registers the
//! reply slot under one lock, which keeps concurrent senders paired FIFO
//! with the reply stream.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::bytes::Bytes;

use crate::channel::{ChannelError, DuplexChannel, MAX_FRAME_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("message of {len} bytes exceeds the {max} byte frame limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("reply is not valid UTF-8")]
    ReplyNotText,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The configured wait elapsed with no reply. The caller may resend, but
    /// under order-only correlation a reply arriving after the timeout is
    /// discarded and the stream may be off by one for the request that
    /// produced it.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// One outstanding send: the queued write acknowledgement plus a single-shot
/// reply slot. Resolves exactly once - with the correlated reply, a channel
/// error, or a timeout - then is discarded.
struct PendingRequest {
    write_ack: oneshot::Receiver<Result<(), ChannelError>>,
    reply: oneshot::Receiver<Result<Bytes, ChannelError>>,
}

impl PendingRequest {
    async fn resolve(self, reply_timeout: Duration) -> Result<String, GatewayError> {
        match self.write_ack.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ChannelError::Closed.into()),
        }

        let frame = match tokio::time::timeout(reply_timeout, self.reply).await {
            Ok(Ok(Ok(frame))) => frame,
            Ok(Ok(Err(e))) => return Err(e.into()),
            Ok(Err(_)) => return Err(ChannelError::Closed.into()),
            Err(_) => return Err(GatewayError::Timeout(reply_timeout)),
        };

        String::from_utf8(frame.to_vec()).map_err(|_| GatewayError::ReplyNotText)
    }
}

/// Sends a textual message and correlates it with a single textual reply.
pub struct MessageGateway {
    channel: Arc<DuplexChannel>,
    reply_timeout: Duration,
    /// Serializes write-enqueue + reply-slot registration so send order and
    /// reply order cannot interleave.
    order: Mutex<()>,
}

impl MessageGateway {
    pub fn new(channel: Arc<DuplexChannel>, reply_timeout: Duration) -> Self {
        Self {
            channel,
            reply_timeout,
            order: Mutex::new(()),
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Send `message` and wait for the worklet's reply to it.
    pub async fn send(&self, message: &str) -> Result<String, GatewayError> {
        if message.len() > MAX_FRAME_BYTES {
            return Err(GatewayError::MessageTooLarge {
                len: message.len(),
                max: MAX_FRAME_BYTES,
            });
        }

        let frame = Bytes::copy_from_slice(message.as_bytes());
        let pending = {
            let _order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
            PendingRequest {
                write_ack: self.channel.enqueue_write(frame),
                reply: self.channel.enqueue_read(),
            }
        };

        tracing::trace!(len = message.len(), "Request queued");
        pending.resolve(self.reply_timeout).await
    }
}
