//! Process-wide registry of live group call sessions.
//!
//! The registry is an injected handle, not a singleton; only `enter()` and
//! `leave()` mutate it.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::session::GroupCallSession;
use crate::types::ids::VoipId;

#[derive(Default)]
pub struct CallRegistry {
    sessions: RwLock<HashMap<VoipId, Arc<GroupCallSession>>>,
}

impl CallRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, session: Arc<GroupCallSession>) {
        self.sessions
            .write()
            .await
            .insert(session.voip_id().clone(), session);
    }

    pub async fn remove(&self, id: &VoipId) -> Option<Arc<GroupCallSession>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn get(&self, id: &VoipId) -> Option<Arc<GroupCallSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &VoipId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn voip_ids(&self) -> Vec<VoipId> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
