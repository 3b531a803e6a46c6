// src/bus/local.rs

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::bus::{EngineMessage, MessageBus};
use crate::errors::{ConvergeError, Result};

/// In-process bus: a bounded mpsc channel into one engine's runtime loop.
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: mpsc::Sender<EngineMessage>,
}

impl LocalBus {
    /// Create the bus and the receiver the runtime consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl MessageBus for LocalBus {
    fn send(
        &self,
        message: EngineMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        // Clone the sender so the future doesn't borrow `self` across `await`.
        let tx = self.tx.clone();

        Box::pin(async move {
            tx.send(message)
                .await
                .map_err(|_| ConvergeError::InvalidState("engine message bus closed".to_string()))
        })
    }
}
