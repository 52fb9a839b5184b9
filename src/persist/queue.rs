use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};

use crate::errors::{Error, Result};
use crate::persist::{PersistDelta, Persistence};

enum Message {
    Save(PersistDelta),
    Clear,
    Flush(Sender<()>),
    Shutdown,
}

/// What the worker reports back to the editing task.
#[derive(Debug, Clone)]
pub enum PersistEvent {
    Saved { saved: usize, deleted: usize },
    Cleared,
    Failed(Error),
}

/// Serializes all writes to a store on one background thread. Deltas are
/// applied in submission order.
pub struct PersistQueue {
    sender: Sender<Message>,
    events: Receiver<PersistEvent>,
    worker: Option<JoinHandle<()>>,
}

fn run(mut store: Box<dyn Persistence + Send>, messages: Receiver<Message>, events: Sender<PersistEvent>) {
    for message in messages.iter() {
        let event = match message {
            Message::Save(delta) => match store.save_delta(&delta) {
                Ok(()) => PersistEvent::Saved {
                    saved: delta.save_count(),
                    deleted: delta.delete_count(),
                },
                Err(err) => {
                    error!(error = err.message.as_str(); "Failed saving to cache");
                    PersistEvent::Failed(err)
                }
            },
            Message::Clear => match store.clear() {
                Ok(()) => PersistEvent::Cleared,
                Err(err) => {
                    error!(error = err.message.as_str(); "Failed clearing cache");
                    PersistEvent::Failed(err)
                }
            },
            Message::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            Message::Shutdown => break,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    info!("Persistence worker stopped");
}

impl PersistQueue {
    pub fn spawn(store: Box<dyn Persistence + Send>) -> Result<Self> {
        let (sender, messages) = unbounded();
        let (event_sender, events) = unbounded();
        let worker = thread::Builder::new()
            .name("persist".to_string())
            .spawn(move || run(store, messages, event_sender))?;
        Ok(PersistQueue {
            sender,
            events,
            worker: Some(worker),
        })
    }

    fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| Error::persistence("Persistence worker is gone"))
    }

    pub fn save(&self, delta: PersistDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        self.send(Message::Save(delta))
    }

    pub fn clear(&self) -> Result<()> {
        self.send(Message::Clear)
    }

    /// Blocks until every message queued before this call was handled.
    pub fn flush(&self) -> Result<()> {
        let (done, wait) = unbounded();
        self.send(Message::Flush(done))?;
        wait.recv()
            .map_err(|_| Error::persistence("Persistence worker stopped before flushing"))
    }

    pub fn poll_events(&self) -> Vec<PersistEvent> {
        self.events.try_iter().collect()
    }
}

impl Drop for PersistQueue {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Persistence worker panicked");
            }
        }
    }
}
