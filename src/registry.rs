//! Handle-addressed inlets.
//!
//! Binding layers hold plain numbers, not Rust references. The registry
//! hands out a [`Handle`] per listener and resolves it on every call.
//! Handles count up from 1 and are never reused.

use log::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{BufferSide, Clock};
use crate::error::{Error, Result};
use crate::net::receiver::{available_streams, InletSamples, Receiver};
use crate::net::{InletConfig, StreamInfo, Transport};
use crate::stream::StreamKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Handle {
    fn from(id: u64) -> Handle {
        Handle(id)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Items addressed by handle.
pub struct Arena<T> {
    items: RwLock<HashMap<u64, Arc<T>>>,
    next: AtomicU64,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Arena<T> {
        Arena {
            items: RwLock::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, item: T) -> Handle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.items.write().insert(id, Arc::new(item));
        Handle(id)
    }

    pub fn get(&self, handle: Handle) -> Result<Arc<T>> {
        self.items
            .read()
            .get(&handle.0)
            .cloned()
            .ok_or(Error::UnknownHandle(handle.0))
    }

    pub fn remove(&self, handle: Handle) -> Result<Arc<T>> {
        self.items
            .write()
            .remove(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))
    }

    /// Live handles in creation order.
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self.items.read().keys().map(|id| Handle(*id)).collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn drain(&self) -> Vec<Arc<T>> {
        self.items.write().drain().map(|(_, item)| item).collect()
    }
}

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Listeners over one transport.
pub struct StreamRegistry {
    transport: Arc<dyn Transport>,
    receivers: Arena<Receiver>,
}

impl StreamRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> StreamRegistry {
        StreamRegistry {
            transport,
            receivers: Arena::new(),
        }
    }

    /// Advertised streams of `kind`, or all of them. Kinds that cannot be
    /// listened to are refused.
    pub fn streams(&self, kind: Option<StreamKind>, timeout: Option<Duration>) -> Result<Vec<StreamInfo>> {
        available_streams(
            self.transport.as_ref(),
            kind,
            timeout.unwrap_or(DISCOVERY_TIMEOUT),
        )
    }

    /// Subscribe to the stream published under `source_id`.
    pub fn create_listener(
        &self,
        source_id: &str,
        initial_capacity: Option<usize>,
        auto_start: Option<bool>,
    ) -> Result<Handle> {
        let kind = crate::net::receiver::source_kind(source_id)?;
        let mut config = InletConfig::for_kind(kind);
        if let Some(capacity) = initial_capacity {
            config.initial_capacity = capacity;
        }
        config.auto_start = auto_start.unwrap_or(false);
        self.create_listener_with(source_id, config)
    }

    pub fn create_listener_with(&self, source_id: &str, config: InletConfig) -> Result<Handle> {
        let receiver = Receiver::connect(self.transport.as_ref(), source_id, config)?;
        let handle = self.receivers.insert(receiver);
        debug!("listener {} created for {}", handle, source_id);
        Ok(handle)
    }

    pub fn receiver(&self, handle: Handle) -> Result<Arc<Receiver>> {
        self.receivers.get(handle)
    }

    pub fn start_listening(&self, handle: Handle) -> Result<bool> {
        self.receivers.get(handle)?.start_listening()
    }

    pub fn is_listening(&self, handle: Handle) -> Result<bool> {
        Ok(self.receivers.get(handle)?.is_listening())
    }

    pub fn stop_listening(&self, handle: Handle, clear_buffer: Option<bool>) -> Result<bool> {
        Ok(self.receivers.get(handle)?.stop_listening(clear_buffer))
    }

    /// Stop and forget a listener. Its handle is dead from here on.
    pub fn delete_listener(&self, handle: Handle) -> Result<()> {
        let receiver = self.receivers.remove(handle)?;
        receiver.stop_listening(None);
        debug!("listener {} deleted", handle);
        Ok(())
    }

    /// Live listener handles, oldest first.
    pub fn listeners(&self) -> Vec<Handle> {
        self.receivers.handles()
    }

    /// Delete every listener.
    pub fn clear_listeners(&self) {
        for receiver in self.receivers.drain() {
            receiver.stop_listening(None);
        }
    }

    pub fn kind(&self, handle: Handle) -> Result<StreamKind> {
        Ok(self.receivers.get(handle)?.kind())
    }

    pub fn info(&self, handle: Handle) -> Result<StreamInfo> {
        Ok(self.receivers.get(handle)?.info().clone())
    }

    pub fn time_correction(&self, handle: Handle) -> Result<f64> {
        Ok(self.receivers.get(handle)?.time_correction())
    }

    pub fn consume_n(
        &self,
        handle: Handle,
        n: Option<usize>,
        side: Option<BufferSide>,
    ) -> Result<InletSamples> {
        Ok(self.receivers.get(handle)?.consume_n(n, side))
    }

    pub fn peek_n(&self, handle: Handle, n: Option<usize>, side: Option<BufferSide>) -> Result<InletSamples> {
        Ok(self.receivers.get(handle)?.peek_n(n, side))
    }

    pub fn consume_time_range(
        &self,
        handle: Handle,
        t0: Option<i64>,
        t1: Option<i64>,
        clock: Option<Clock>,
    ) -> Result<InletSamples> {
        self.receivers.get(handle)?.consume_time_range(t0, t1, clock)
    }

    pub fn peek_time_range(
        &self,
        handle: Handle,
        t0: Option<i64>,
        t1: Option<i64>,
        clock: Option<Clock>,
    ) -> Result<InletSamples> {
        self.receivers.get(handle)?.peek_time_range(t0, t1, clock)
    }

    pub fn clear(&self, handle: Handle) -> Result<()> {
        self.receivers.get(handle)?.clear();
        Ok(())
    }

    pub fn clear_time_range(
        &self,
        handle: Handle,
        t0: Option<i64>,
        t1: Option<i64>,
        clock: Option<Clock>,
    ) -> Result<()> {
        self.receivers.get(handle)?.clear_time_range(t0, t1, clock)
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.clear_listeners();
    }
}
