use crate::catalog::Catalog;
use crate::error::DubResult;
use crate::store::{BlobStore, StoredBlob};
use crate::worker::JobRunner;
use crate::{NewVideo, Progress, VideoRecord};
use bytes::Bytes;
use futures::Stream;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Acknowledgement for an accepted dubbing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DubTicket {
    pub video_id: Uuid,
    pub estimated: Duration,
}

/// Ties blob storage, the catalog and the job runner together.
#[derive(Clone)]
pub struct VideoService {
    catalog: Catalog,
    store: BlobStore,
    runner: JobRunner,
}

impl VideoService {
    pub fn new(store: BlobStore, tick: Duration, cancel_token: &CancellationToken) -> Self {
        let catalog = Catalog::new();
        let runner = JobRunner::new(catalog.clone(), tick, cancel_token);
        VideoService {
            catalog,
            store,
            runner,
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub async fn store_blob<S, E>(
        &self,
        stream: S,
        original_name: &str,
        declared_size: Option<u64>,
        mime_type: Option<&str>,
    ) -> DubResult<StoredBlob>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.store
            .store(stream, original_name, declared_size, mime_type)
            .await
    }

    /// Creates the catalog record for a blob that has been written.
    pub fn register(&self, blob: StoredBlob, title: Option<String>) -> VideoRecord {
        let url = self.store.url_for(&blob.stored_name);
        let video = self.catalog.create(NewVideo {
            stored_name: blob.stored_name,
            original_name: blob.original_name,
            title,
            url,
            size_bytes: blob.size_bytes,
            mime_type: blob.mime_type,
        });
        info!(message = "Video uploaded", video_id = %video.id, title = %video.title, size_bytes = video.size_bytes);
        video
    }

    /// Drops a blob whose upload request failed before it was registered.
    pub async fn discard_blob(&self, blob: &StoredBlob) {
        if let Err(err) = self.store.remove(&blob.stored_name).await {
            warn!(message = "Failed to discard unregistered blob", stored_name = %blob.stored_name, error = ?err);
        }
    }

    pub async fn upload<S, E>(
        &self,
        stream: S,
        original_name: &str,
        declared_size: Option<u64>,
        mime_type: Option<&str>,
        title: Option<String>,
    ) -> DubResult<VideoRecord>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let blob = self
            .store_blob(stream, original_name, declared_size, mime_type)
            .await?;
        Ok(self.register(blob, title))
    }

    pub fn list(&self) -> Vec<VideoRecord> {
        self.catalog.list()
    }

    pub fn get(&self, id: Uuid) -> DubResult<VideoRecord> {
        self.catalog.get(id)
    }

    pub fn progress(&self, id: Uuid) -> DubResult<Progress> {
        self.runner.snapshot(id)
    }

    pub fn dub(&self, id: Uuid) -> DubResult<DubTicket> {
        self.runner.start(id)?;
        Ok(DubTicket {
            video_id: id,
            estimated: self.runner.estimated_duration(),
        })
    }

    /// Removes the blob, stops any running job and forgets the video.
    ///
    /// If the blob exists but cannot be removed, the record stays in place
    /// and the I/O error is returned.
    #[instrument(name = "video.delete", skip_all, fields(video_id = %id))]
    pub async fn delete(&self, id: Uuid) -> DubResult<()> {
        let video = self.catalog.get(id)?;

        if let Err(err) = self.store.remove(&video.stored_name).await {
            warn!(message = "Failed to remove blob", stored_name = %video.stored_name, error = ?err);
            return Err(err);
        }

        self.runner.cancel(id);
        self.catalog.delete(id)?;
        info!("Video deleted");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DubError;
    use crate::Status;
    use futures::stream;

    fn payload(size: usize) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        stream::iter(vec![Ok(Bytes::from(vec![7u8; size]))])
    }

    fn service(dir: &std::path::Path, max_bytes: u64) -> VideoService {
        let store = BlobStore::new(dir.join("uploads"), max_bytes);
        VideoService::new(store, Duration::from_millis(100), &CancellationToken::new())
    }

    #[tokio::test]
    async fn upload_registers_uploaded_video() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), 1024);

        let video = service
            .upload(payload(500), "sample.mp4", Some(500), None, Some("Test".into()))
            .await
            .unwrap();

        assert_eq!(video.title, "Test");
        assert_eq!(video.status, Status::Uploaded);
        assert_eq!(video.size_bytes, 500);
        assert_eq!(video.mime_type, "video/mp4");
        assert_eq!(video.url, format!("/uploads/{}", video.stored_name));
        assert_eq!(service.list(), vec![video]);
    }

    #[tokio::test]
    async fn rejected_uploads_create_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), 100);

        let wrong_type = service.upload(payload(10), "notes.txt", None, None, None).await;
        let too_big = service.upload(payload(101), "big.mp4", None, None, None).await;

        assert!(matches!(wrong_type, Err(DubError::InvalidFormat(_))));
        assert!(matches!(too_big, Err(DubError::PayloadTooLarge { limit: 100 })));
        assert!(service.list().is_empty());
        for stored in [service.store().root(), service.store().staging()] {
            assert_eq!(std::fs::read_dir(stored).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn delete_removes_blob_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), 1024);
        let video = service
            .upload(payload(16), "clip.webm", None, None, None)
            .await
            .unwrap();
        let path = service.store().path_for(&video.stored_name);
        assert!(path.exists());

        service.dub(video.id).unwrap();
        service.delete(video.id).await.unwrap();

        assert!(!path.exists());
        assert!(!service.runner().is_running(video.id));
        assert!(matches!(service.progress(video.id), Err(DubError::NotFound(_))));
        assert!(matches!(service.delete(video.id).await, Err(DubError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_tolerates_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), 1024);
        let video = service
            .upload(payload(16), "clip.mkv", None, None, None)
            .await
            .unwrap();
        std::fs::remove_file(service.store().path_for(&video.stored_name)).unwrap();

        service.delete(video.id).await.unwrap();

        assert!(service.list().is_empty());
    }

    #[tokio::test]
    async fn delete_keeps_record_when_blob_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), 1024);
        let video = service
            .upload(payload(16), "clip.mp4", None, None, None)
            .await
            .unwrap();
        let path = service.store().path_for(&video.stored_name);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("pinned"), b"x").unwrap();

        let result = service.delete(video.id).await;

        assert!(matches!(result, Err(DubError::Io(_))));
        assert_eq!(service.get(video.id).unwrap(), video);
        assert!(path.join("pinned").exists());
    }

    #[tokio::test]
    async fn dub_reports_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), 1024);
        let video = service
            .upload(payload(16), "clip.mov", None, None, None)
            .await
            .unwrap();

        let ticket = service.dub(video.id).unwrap();

        assert_eq!(ticket.video_id, video.id);
        assert_eq!(ticket.estimated, Duration::from_secs(1));
        assert!(matches!(service.dub(video.id), Err(DubError::AlreadyInProgress(_))));
        assert_eq!(service.progress(video.id).unwrap().status, Status::Processing);
        service.shutdown().await;
    }
}
