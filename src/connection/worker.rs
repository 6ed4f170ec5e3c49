//! Dispatch worker
//!
//! One task per connection. It owns the store link, runs batches strictly in
//! the order they were queued (one round trip at a time), and fans replies
//! out to the per-command callbacks. Between batches it watches the link, so
//! a server hanging up on an idle connection degrades it right away.
//!
//! After a lost link the worker sits out the reconnect delay, failing
//! batches queued meanwhile, before connecting again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use super::pipeline::CommandCallback;
use super::Shared;
use crate::error::{CacheError, Result};
use crate::protocol::Command;
use crate::store::{Connector, Store};

/// A queued pipeline
pub(crate) struct Batch {
    pub(crate) commands: Vec<Command>,
    pub(crate) callbacks: Vec<Option<CommandCallback>>,
}

impl Batch {
    /// Deliver the same failure to every callback
    pub(crate) fn fail(self, err: &CacheError) {
        for callback in self.callbacks.into_iter().flatten() {
            callback(Err(err.clone()));
        }
    }
}

/// Requests to the worker
pub(crate) enum Message {
    Batch(Batch),
    Close,
}

/// What ended the wait for the next batch
enum Wake {
    Message(Option<Message>),
    Lost(CacheError),
}

pub(crate) struct Worker {
    connector: Box<dyn Connector>,
    inbox: UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    reconnect_delay: Duration,
}

impl Worker {
    pub(crate) fn new(
        connector: Box<dyn Connector>,
        inbox: UnboundedReceiver<Message>,
        shared: Arc<Shared>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            connector,
            inbox,
            shared,
            reconnect_delay,
        }
    }

    /// Run until closed or until every connection handle is dropped
    pub(crate) async fn run(mut self) {
        let mut store: Option<Arc<dyn Store>> = None;

        loop {
            let current = match store.clone() {
                Some(current) => current,
                None => match self.connector.connect().await {
                    Ok(connected) => {
                        self.shared.mark_ready();
                        store = Some(Arc::clone(&connected));
                        connected
                    }
                    Err(err) => {
                        self.shared.degrade(&err);
                        if self.wait_for_retry(&err).await {
                            continue;
                        }
                        self.finish(None).await;
                        return;
                    }
                },
            };

            // The watch holds the link, so it must be gone before dispatching
            let wake = tokio::select! {
                message = self.inbox.recv() => Wake::Message(message),
                err = current.closed() => Wake::Lost(err),
            };

            let lost = match wake {
                Wake::Message(Some(Message::Batch(batch))) => {
                    dispatch(current.as_ref(), batch).await.err()
                }
                Wake::Lost(err) => Some(err),
                Wake::Message(Some(Message::Close)) | Wake::Message(None) => {
                    self.finish(Some(current)).await;
                    return;
                }
            };

            if let Some(err) = lost {
                self.shared.degrade(&err);
                store = None;
                if !self.wait_for_retry(&err).await {
                    self.finish(None).await;
                    return;
                }
            }
        }
    }

    /// Sit out the reconnect delay, failing batches queued meanwhile
    ///
    /// Returns false if a close was requested.
    async fn wait_for_retry(&mut self, err: &CacheError) -> bool {
        let retry = tokio::time::sleep(self.reconnect_delay);
        tokio::pin!(retry);

        loop {
            tokio::select! {
                _ = &mut retry => return true,
                message = self.inbox.recv() => match message {
                    Some(Message::Batch(batch)) => batch.fail(err),
                    Some(Message::Close) | None => return false,
                },
            }
        }
    }

    /// Quit the link, reject stragglers, publish Closed
    async fn finish(&mut self, store: Option<Arc<dyn Store>>) {
        if let Some(store) = store {
            if let Err(err) = store.quit().await {
                tracing::debug!("Error while quitting store link: {}", err);
            }
        }

        self.inbox.close();
        while let Ok(message) = self.inbox.try_recv() {
            if let Message::Batch(batch) = message {
                batch.fail(&CacheError::Closed);
            }
        }

        self.shared.mark_closed();
    }
}

/// Execute one batch and deliver its replies
async fn dispatch(store: &dyn Store, batch: Batch) -> Result<()> {
    let Batch {
        commands,
        callbacks,
    } = batch;
    let count = commands.len();
    tracing::trace!("Dispatching batch of {} commands", count);

    let replies = match store.execute(commands).await {
        Ok(replies) if replies.len() == count => replies,
        Ok(replies) => {
            let err = CacheError::Protocol(format!(
                "Expected {} replies, got {}",
                count,
                replies.len()
            ));
            Batch {
                commands: Vec::new(),
                callbacks,
            }
            .fail(&err);
            return Err(err);
        }
        Err(err) => {
            Batch {
                commands: Vec::new(),
                callbacks,
            }
            .fail(&err);
            return Err(err);
        }
    };

    for (callback, reply) in callbacks.into_iter().zip(replies) {
        if let Some(callback) = callback {
            callback(reply.into_result());
        }
    }
    Ok(())
}
