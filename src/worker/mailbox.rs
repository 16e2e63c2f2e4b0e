use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// What a producer experiences when the mailbox is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullPolicy {
    /// Wait for space, up to `block_timeout`.
    #[default]
    Block,
    /// Fail immediately with `MailboxError::Full`.
    Reject,
}

/// Bounded mailbox configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxConfig {
    /// Queue slots. Default: 1000.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Behavior when full. Default: block.
    #[serde(default)]
    pub policy: FullPolicy,

    /// Longest a blocked producer waits before giving up. Default: 10s.
    #[serde(default = "default_block_timeout", with = "humantime_serde")]
    pub block_timeout: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            policy: FullPolicy::default(),
            block_timeout: default_block_timeout(),
        }
    }
}

fn default_capacity() -> usize {
    1000
}

fn default_block_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Items travelling through a worker mailbox.
#[derive(Debug)]
pub enum Envelope<T> {
    Message(T),
    /// Flush accumulated state now.
    EndOfBatch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("mailbox is closed")]
    Closed,
}

/// Producer half of a worker mailbox.
pub struct Mailbox<T> {
    tx: mpsc::Sender<Envelope<T>>,
    policy: FullPolicy,
    block_timeout: Duration,
    capacity: usize,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            policy: self.policy,
            block_timeout: self.block_timeout,
            capacity: self.capacity,
        }
    }
}

/// Creates a mailbox and the receiver its single consumer drains.
pub fn channel<T>(cfg: &MailboxConfig) -> (Mailbox<T>, mpsc::Receiver<Envelope<T>>) {
    let capacity = cfg.capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);

    (
        Mailbox {
            tx,
            policy: cfg.policy,
            block_timeout: cfg.block_timeout,
            capacity,
        },
        rx,
    )
}

impl<T: Send> Mailbox<T> {
    /// Enqueues a message according to the full policy. Never drops silently.
    pub async fn offer(&self, message: T) -> Result<(), MailboxError> {
        match self.policy {
            FullPolicy::Reject => {
                self.tx
                    .try_send(Envelope::Message(message))
                    .map_err(|e| match e {
                        TrySendError::Full(_) => MailboxError::Full {
                            capacity: self.capacity,
                        },
                        TrySendError::Closed(_) => MailboxError::Closed,
                    })
            }
            FullPolicy::Block => {
                match tokio::time::timeout(
                    self.block_timeout,
                    self.tx.send(Envelope::Message(message)),
                )
                .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(MailboxError::Closed),
                    Err(_) => Err(MailboxError::Full {
                        capacity: self.capacity,
                    }),
                }
            }
        }
    }

    /// Injects an end-of-batch marker.
    ///
    /// A full mailbox is not an error: the consumer flushes as soon as it
    /// catches up with the queue anyway.
    pub fn end_of_batch(&self) -> Result<(), MailboxError> {
        match self.tx.try_send(Envelope::EndOfBatch) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(MailboxError::Closed),
        }
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
