//! Token-keyed registry of per-session controllers
//!
//! Not consulted by the hub. Stages that need to route work to a specific
//! session keep their controllers here.

use dashmap::DashMap;
use std::sync::Arc;

use crate::session::SessionToken;

pub struct StreamRegistry<C> {
    streams: DashMap<SessionToken, Arc<C>>,
}

impl<C> Default for StreamRegistry<C> {
    fn default() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }
}

impl<C> StreamRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, token: &SessionToken) -> bool {
        self.streams.contains_key(token)
    }

    pub fn get(&self, token: &SessionToken) -> Option<Arc<C>> {
        self.streams.get(token).map(|entry| entry.value().clone())
    }

    /// Store a controller, returning the one it replaced
    pub fn add(&self, token: SessionToken, controller: Arc<C>) -> Option<Arc<C>> {
        self.streams.insert(token, controller)
    }

    pub fn delete(&self, token: &SessionToken) -> Option<Arc<C>> {
        self.streams.remove(token).map(|(_, controller)| controller)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }
}
