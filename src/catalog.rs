use crate::error::{DubError, DubResult};
use crate::{NewVideo, Status, VideoRecord};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// In-memory registry of uploaded videos.
///
/// The catalog lives for the lifetime of the process and is lost on restart.
/// Cloning yields another handle onto the same records. Every mutation runs
/// under a single write lock, so updates for one id never interleave.
#[derive(Clone, Default)]
pub struct Catalog {
    inner: Arc<RwLock<Records>>,
}

#[derive(Default)]
struct Records {
    by_id: HashMap<Uuid, VideoRecord>,
    order: Vec<Uuid>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, video: NewVideo) -> VideoRecord {
        let title = video
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| video.original_name.clone());

        let mut records = self.inner.write();
        let mut id = Uuid::new_v4();
        while records.by_id.contains_key(&id) {
            id = Uuid::new_v4();
        }

        let record = VideoRecord {
            id,
            stored_name: video.stored_name,
            original_name: video.original_name,
            title,
            url: video.url,
            size_bytes: video.size_bytes,
            mime_type: video.mime_type,
            created_at: Utc::now(),
            status: Status::Uploaded,
            progress: 0,
            dub_available: false,
            dubbed_name: None,
        };

        debug!(message = "Cataloged video", video_id = %id, stored_name = %record.stored_name);
        records.by_id.insert(id, record.clone());
        records.order.push(id);
        record
    }

    /// Snapshot of every record in upload order.
    pub fn list(&self) -> Vec<VideoRecord> {
        let records = self.inner.read();
        records
            .order
            .iter()
            .filter_map(|id| records.by_id.get(id))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: Uuid) -> DubResult<VideoRecord> {
        self.inner
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(DubError::NotFound(id))
    }

    /// Applies `mutator` to the record with `id` while holding the write lock.
    pub fn update<F, R>(&self, id: Uuid, mutator: F) -> DubResult<R>
    where
        F: FnOnce(&mut VideoRecord) -> R,
    {
        let mut records = self.inner.write();
        let record = records.by_id.get_mut(&id).ok_or(DubError::NotFound(id))?;
        Ok(mutator(record))
    }

    pub fn delete(&self, id: Uuid) -> DubResult<VideoRecord> {
        let mut records = self.inner.write();
        let record = records.by_id.remove(&id).ok_or(DubError::NotFound(id))?;
        records.order.retain(|entry| *entry != id);
        debug!(message = "Removed video from catalog", video_id = %id);
        Ok(record)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
