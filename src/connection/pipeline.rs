//! Pipeline builder
//!
//! Collects commands, each with its own completion callback, and hands them
//! to the connection's dispatch worker as one batch.

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;

use super::worker::{Batch, Message};
use crate::error::{CacheError, Result};
use crate::protocol::{Command, Reply};

/// Completion callback for one pipelined command
pub type CommandCallback = Box<dyn FnOnce(Result<Reply>) + Send + 'static>;

/// A batch of commands under construction
///
/// Callbacks run on the dispatch worker, in command order, once the round
/// trip completes. A failed command only affects its own callback.
pub struct Pipeline {
    commands: Vec<Command>,
    callbacks: Vec<Option<CommandCallback>>,
    dispatch: UnboundedSender<Message>,
    runtime: Handle,
}

impl Pipeline {
    pub(crate) fn new(dispatch: UnboundedSender<Message>, runtime: Handle) -> Self {
        Self {
            commands: Vec::new(),
            callbacks: Vec::new(),
            dispatch,
            runtime,
        }
    }

    /// Queue a command whose reply nobody waits for
    pub fn queue(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self.callbacks.push(None);
        self
    }

    /// Queue a command with a completion callback
    pub fn queue_with<F>(&mut self, command: Command, callback: F) -> &mut Self
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.commands.push(command);
        self.callbacks.push(Some(Box::new(callback)));
        self
    }

    /// SET, or SETEX when `ttl` is given
    pub fn set<F>(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Option<u64>,
        callback: F,
    ) -> &mut Self
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        let key = key.into();
        let value = value.into();
        let command = match ttl {
            Some(ttl) => Command::SetEx { key, ttl, value },
            None => Command::Set { key, value },
        };
        self.queue_with(command, callback)
    }

    /// SETEX: value with an expiry in seconds
    pub fn setex<F>(
        &mut self,
        key: impl Into<String>,
        ttl: u64,
        value: impl Into<Bytes>,
        callback: F,
    ) -> &mut Self
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.queue_with(
            Command::SetEx {
                key: key.into(),
                ttl,
                value: value.into(),
            },
            callback,
        )
    }

    /// MSET: several values in one command
    pub fn mset<F>(&mut self, pairs: Vec<(String, Bytes)>, callback: F) -> &mut Self
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.queue_with(Command::MSet { pairs }, callback)
    }

    /// DEL: one or more keys
    pub fn del<F>(&mut self, keys: Vec<String>, callback: F) -> &mut Self
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.queue_with(Command::Del { keys }, callback)
    }

    /// GET: one key
    pub fn get<F>(&mut self, key: impl Into<String>, callback: F) -> &mut Self
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.queue_with(Command::Get { key: key.into() }, callback)
    }

    /// MGET: several keys, answered as one array
    pub fn mget<F>(&mut self, keys: Vec<String>, callback: F) -> &mut Self
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.queue_with(Command::MGet { keys }, callback)
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Dispatch the batch as one round trip
    ///
    /// Returns once the batch is queued on the dispatch worker; replies
    /// arrive through the callbacks. If the connection is closed every
    /// callback receives `CacheError::Closed` from a runtime task, never on
    /// the caller's stack.
    pub fn execute(self) {
        let runtime = self.runtime.clone();
        if let Err(batch) = self.submit() {
            runtime.spawn(async move { batch.fail(&CacheError::Closed) });
        }
    }

    /// Queue the batch on the worker, handing it back if the worker is gone
    pub(crate) fn submit(self) -> std::result::Result<(), Batch> {
        if self.commands.is_empty() {
            return Ok(());
        }

        let batch = Batch {
            commands: self.commands,
            callbacks: self.callbacks,
        };
        match self.dispatch.send(Message::Batch(batch)) {
            Ok(()) => Ok(()),
            Err(rejected) => match rejected.0 {
                Message::Batch(batch) => Err(batch),
                Message::Close => Ok(()),
            },
        }
    }
}
