use crate::models::Snapshot;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Last good snapshot. Starts empty; each successful crawl replaces it whole.
#[derive(Default)]
pub struct SnapshotCache {
    current: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotCache {
    pub async fn get(&self) -> Option<Arc<Snapshot>> {
        self.current.read().await.clone()
    }

    pub async fn replace(&self, snapshot: Arc<Snapshot>) {
        *self.current.write().await = Some(snapshot);
    }
}
