//! Change feed adapters: the lazy, ordered, checkpoint-restartable
//! sequence of document changes the engine consumes.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::document::ChangeEvent;
use crate::error::{Error, ErrorKind, Result};

/// Position within a change feed. Checkpoints are opaque to the engine
/// beyond [`Checkpoint::START`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(pub u64);

impl Checkpoint {
    pub const START: Checkpoint = Checkpoint(0);
}

/// ChangeFeed trait for the storage-layer collaborator delivering
/// document change events in order.
#[async_trait]
pub trait ChangeFeed {
    /// The next change event, `None` once the feed is exhausted.
    async fn next(&mut self) -> Result<Option<ChangeEvent>>;

    /// The current position, suitable for a later [`ChangeFeed::seek`].
    fn checkpoint(&self) -> Checkpoint;

    /// Restarts the feed from a previously observed checkpoint.
    async fn seek(&mut self, checkpoint: Checkpoint) -> Result<()>;
}

/// In-memory feed over a fixed event sequence. Backs tests and rebuilds
/// from a captured snapshot.
pub struct MemoryFeed {
    events: Vec<ChangeEvent>,
    position: usize,
}

impl MemoryFeed {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self {
            events,
            position: 0,
        }
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn next(&mut self) -> Result<Option<ChangeEvent>> {
        match self.events.get(self.position) {
            Some(event) => {
                self.position += 1;
                Ok(Some(event.clone()))
            }
            None => Ok(None),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.position as u64)
    }

    async fn seek(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if checkpoint.0 as usize > self.events.len() {
            return Err(Error::EngineError(ErrorKind::ValidationError(format!(
                "checkpoint {} is beyond the feed end ({})",
                checkpoint.0,
                self.events.len()
            ))));
        }
        self.position = checkpoint.0 as usize;
        Ok(())
    }
}

/// Live feed over an mpsc channel, for adapters that push changes as they
/// happen. Forward-only: it cannot seek backwards past events already
/// consumed.
pub struct ChannelFeed {
    stream: ReceiverStream<ChangeEvent>,
    position: u64,
}

impl ChannelFeed {
    pub fn new(receiver: mpsc::Receiver<ChangeEvent>) -> Self {
        Self {
            stream: ReceiverStream::new(receiver),
            position: 0,
        }
    }
}

#[async_trait]
impl ChangeFeed for ChannelFeed {
    async fn next(&mut self) -> Result<Option<ChangeEvent>> {
        match self.stream.next().await {
            Some(event) => {
                self.position += 1;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.position)
    }

    async fn seek(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if checkpoint.0 != self.position {
            return Err(Error::EngineError(ErrorKind::ValidationError(
                "a live channel feed only supports seeking to its current position".to_string(),
            )));
        }
        Ok(())
    }
}
