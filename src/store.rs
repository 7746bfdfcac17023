use crate::error::{DubError, DubResult};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Hard cap on a single upload: 2 GiB.
pub const MAX_UPLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Extensions accepted for upload, compared case-insensitively.
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["mp4", "avi", "mov", "mkv", "webm"];

/// Public path under which stored blobs are served.
pub const PUBLIC_PREFIX: &str = "/uploads";

const PART_SUFFIX: &str = "part";
const STAGING_SUFFIX: &str = ".partial";

/// A blob that has been fully written under its final name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub stored_name: String,
    pub original_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

/// Directory-backed storage for uploaded videos.
///
/// Uploads in flight live in a sibling staging directory (`<root>.partial`)
/// and only enter `root`, the served directory, once complete.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    staging: PathBuf,
    max_bytes: u64,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        let root: PathBuf = root.into().components().collect();
        let mut staging = root.clone().into_os_string();
        staging.push(STAGING_SUFFIX);
        BlobStore {
            root,
            staging: PathBuf::from(staging),
            max_bytes,
        }
    }

    /// Creates the store and makes sure its directories exist.
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64) -> DubResult<Self> {
        let store = Self::new(root, max_bytes);
        fs::create_dir_all(&store.root).await?;
        fs::create_dir_all(&store.staging).await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn url_for(&self, stored_name: &str) -> String {
        format!("{PUBLIC_PREFIX}/{stored_name}")
    }

    pub fn path_for(&self, stored_name: &str) -> PathBuf {
        self.root.join(stored_name)
    }

    /// Streams an upload to disk under a fresh unique name.
    ///
    /// Bytes land in a `.part` file in the staging directory and are renamed
    /// into `root` only once the whole stream has been written. A failed or
    /// oversized upload never leaves a reachable blob behind.
    #[instrument(skip(self, stream, mime_type), fields(stored_name = tracing::field::Empty))]
    pub async fn store<S, E>(
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
        let extension = allowed_extension(original_name)
            .ok_or_else(|| DubError::InvalidFormat(original_name.to_string()))?;
        if declared_size.is_some_and(|size| size > self.max_bytes) {
            return Err(DubError::PayloadTooLarge {
                limit: self.max_bytes,
            });
        }

        fs::create_dir_all(&self.root).await?;
        fs::create_dir_all(&self.staging).await?;
        let (stored_name, part_path, file) = self.reserve(extension).await?;
        tracing::Span::current().record("stored_name", stored_name.as_str());

        let size_bytes = match self.write_all(stream, file).await {
            Ok(size) => size,
            Err(err) => {
                discard(&part_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&part_path, self.path_for(&stored_name)).await {
            discard(&part_path).await;
            return Err(err.into());
        }

        debug!(message = "Stored upload", size_bytes = size_bytes);
        Ok(StoredBlob {
            stored_name,
            original_name: original_name.to_string(),
            size_bytes,
            mime_type: mime_type
                .filter(|mime| !mime.is_empty() && *mime != "application/octet-stream")
                .map(str::to_string)
                .unwrap_or_else(|| mime_for_extension(extension).to_string()),
        })
    }

    /// Removes a blob. A blob that is already gone is not an error.
    pub async fn remove(&self, stored_name: &str) -> DubResult<()> {
        match fs::remove_file(self.path_for(stored_name)).await {
            Ok(()) => {
                debug!(message = "Removed blob", stored_name = %stored_name);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn reserve(&self, extension: &str) -> DubResult<(String, PathBuf, File)> {
        loop {
            let stored_name = format!("{}.{}", Uuid::new_v4(), extension);
            let final_path = self.path_for(&stored_name);
            if fs::try_exists(&final_path).await? {
                continue;
            }

            let part_path = self.staging.join(format!("{stored_name}.{PART_SUFFIX}"));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&part_path)
                .await
            {
                Ok(file) => return Ok((stored_name, part_path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn write_all<S, E>(&self, stream: S, mut file: File) -> DubResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut stream = std::pin::pin!(stream);
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(DubError::stream)?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                return Err(DubError::PayloadTooLarge {
                    limit: self.max_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

async fn discard(part_path: &Path) {
    if let Err(err) = fs::remove_file(part_path).await {
        if err.kind() != ErrorKind::NotFound {
            warn!(message = "Failed to discard partial upload", path = ?part_path, error = ?err);
        }
    }
}

/// Returns the file's extension when it is on the allow-list.
pub fn allowed_extension(filename: &str) -> Option<&str> {
    let (stem, extension) = filename.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    ALLOWED_EXTENSIONS
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(extension))
        .then_some(extension)
}

fn mime_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}
