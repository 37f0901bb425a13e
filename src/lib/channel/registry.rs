use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::types::{
    ChannelError, ChannelKey, ChannelResult, DEFAULT_CHANNEL_CAPACITY, OperationHandle,
    PendingOperation, Subscription,
};

/// In-memory status channels keyed by [`ChannelKey`].
///
/// Each entry owns both the buffered channel and the cancellation token of
/// the heartbeat feeding it, so removing an entry always tears down both.
pub struct ChannelRegistry {
    operations: Mutex<HashMap<ChannelKey, PendingOperation>>,
    capacity: usize,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        ChannelRegistry {
            operations: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn create(&self, key: &ChannelKey) -> ChannelResult<OperationHandle> {
        let mut operations = self.operations.lock();
        if operations.contains_key(key) {
            return Err(ChannelError::AlreadyExists(key.to_string()));
        }

        let (sender, receiver) = mpsc::channel(self.capacity);
        let operation = PendingOperation {
            generation: Uuid::new_v4(),
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            closed: CancellationToken::new(),
            heartbeat: CancellationToken::new(),
            claimed: false,
        };
        let handle = OperationHandle {
            key: key.clone(),
            generation: operation.generation,
            heartbeat: operation.heartbeat.clone(),
        };

        operations.insert(key.clone(), operation);
        debug!("channel {} created", key);
        Ok(handle)
    }

    /// Marks the live operation as owned by a consumer. A claimed operation
    /// is no longer released by its heartbeat deadline.
    pub fn claim(&self, key: &ChannelKey) -> ChannelResult<OperationHandle> {
        let mut operations = self.operations.lock();
        let operation = operations
            .get_mut(key)
            .ok_or_else(|| ChannelError::NotFound(key.to_string()))?;
        operation.claimed = true;

        Ok(OperationHandle {
            key: key.clone(),
            generation: operation.generation,
            heartbeat: operation.heartbeat.clone(),
        })
    }

    /// Attaches the single reader of a channel. A second reader is refused
    /// with `ReaderAttached` until the first one is dropped.
    pub fn get(&self, key: &ChannelKey) -> ChannelResult<Subscription> {
        let operations = self.operations.lock();
        let operation = operations
            .get(key)
            .ok_or_else(|| ChannelError::NotFound(key.to_string()))?;
        let receiver = operation
            .receiver
            .clone()
            .try_lock_owned()
            .map_err(|_| ChannelError::ReaderAttached(key.to_string()))?;

        Ok(Subscription {
            key: key.clone(),
            receiver,
        })
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.operations.lock().contains_key(key)
    }

    /// Closes and forgets whatever channel is live under `key`.
    pub fn remove(&self, key: &ChannelKey) -> ChannelResult<()> {
        let operation = self
            .operations
            .lock()
            .remove(key)
            .ok_or_else(|| ChannelError::NotFound(key.to_string()))?;
        close(operation);
        debug!("channel {} removed", key);
        Ok(())
    }

    /// Removes the channel only if it is still the generation `handle`
    /// refers to.
    pub fn release(&self, handle: &OperationHandle) -> ChannelResult<()> {
        handle.heartbeat.cancel();

        let mut operations = self.operations.lock();
        match operations.get(&handle.key) {
            Some(operation) if operation.generation == handle.generation => {}
            _ => return Err(ChannelError::NotFound(handle.key.to_string())),
        }
        if let Some(operation) = operations.remove(&handle.key) {
            close(operation);
        }
        debug!("channel {} released", handle.key);
        Ok(())
    }

    /// Heartbeat deadline path: drops an unclaimed operation. Returns
    /// whether anything was removed.
    pub fn expire(&self, handle: &OperationHandle) -> bool {
        let mut operations = self.operations.lock();
        match operations.get(&handle.key) {
            Some(operation) if operation.generation == handle.generation && !operation.claimed => {}
            _ => return false,
        }
        if let Some(operation) = operations.remove(&handle.key) {
            close(operation);
        }
        debug!("channel {} expired", handle.key);
        true
    }

    /// Waits for buffer space. Fails with `Closed` if the channel is
    /// removed while waiting.
    pub async fn send(&self, key: &ChannelKey, message: String) -> ChannelResult<()> {
        let (sender, closed) = {
            let operations = self.operations.lock();
            let operation = operations
                .get(key)
                .ok_or_else(|| ChannelError::NotFound(key.to_string()))?;
            (operation.sender.clone(), operation.closed.clone())
        };

        tokio::select! {
            result = sender.send(message) => {
                result.map_err(|_| ChannelError::Closed(key.to_string()))
            }
            _ = closed.cancelled() => Err(ChannelError::Closed(key.to_string())),
        }
    }

    /// Non-blocking send; returns `Ok(false)` when the buffer is full and
    /// the message was dropped.
    pub fn try_send(&self, key: &ChannelKey, message: String) -> ChannelResult<bool> {
        let operations = self.operations.lock();
        let operation = operations
            .get(key)
            .ok_or_else(|| ChannelError::NotFound(key.to_string()))?;

        match operation.sender.try_send(message) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ChannelError::Closed(key.to_string()))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn close(operation: PendingOperation) {
    operation.heartbeat.cancel();
    operation.closed.cancel();
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}
