//! Cross-core message channel endpoints.
//!
//! The only legal way for one shard to affect state on another is to send a
//! [`ShardMessage`] into the destination's mailbox and await the reply on a
//! oneshot channel. Messages from different origin shards to the same
//! destination are not ordered relative to each other; operations re-validate
//! state on arrival.

use tokio::sync::{mpsc, oneshot};

use crate::error::Errc;
use crate::shard::{ShardReply, ShardRequest};
use crate::types::ShardId;

/// One queued cross-core request and its reply channel.
pub struct ShardMessage {
    pub request: ShardRequest,
    pub reply: oneshot::Sender<ShardReply>,
}

/// Sending endpoint of one shard's mailbox. Cheap to clone.
#[derive(Clone)]
pub struct ShardMailbox {
    shard: ShardId,
    tx: mpsc::UnboundedSender<ShardMessage>,
}

impl ShardMailbox {
    /// Create the mailbox pair for a shard. The receiver is moved into the
    /// shard's message loop.
    pub fn new(shard: ShardId) -> (Self, mpsc::UnboundedReceiver<ShardMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { shard, tx }, rx)
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Enqueue a request; the returned receiver resolves with the reply.
    ///
    /// Fails with `ShuttingDown` once the destination's message loop is gone.
    pub fn send(&self, request: ShardRequest) -> Result<oneshot::Receiver<ShardReply>, Errc> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ShardMessage {
                request,
                reply: reply_tx,
            })
            .map_err(|_| Errc::ShuttingDown)?;
        Ok(reply_rx)
    }
}
