use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod catalog;
pub mod config;
pub mod error;
pub mod server;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::DubError;

/// Prefix of the artifact name produced by a finished dubbing job.
pub const DUB_PREFIX: &str = "hindi-dub-";

/// Metadata captured at upload time, before the video gets an identity.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub stored_name: String,
    pub original_name: String,
    pub title: Option<String>,
    pub url: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: Uuid,
    pub stored_name: String,
    pub original_name: String,
    pub title: String,
    pub url: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub status: Status,
    pub progress: u8,
    pub dub_available: bool,
    pub dubbed_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Uploaded,
    Processing,
    Completed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Uploaded => "uploaded",
            Status::Processing => "processing",
            Status::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Read-only view of a video's dubbing state, as returned to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub status: Status,
    pub progress: u8,
    pub dub_available: bool,
}

impl From<&VideoRecord> for Progress {
    fn from(video: &VideoRecord) -> Self {
        Progress {
            status: video.status,
            progress: video.progress,
            dub_available: video.dub_available,
        }
    }
}

/// Name of the dubbed artifact derived from a stored blob name.
pub fn dubbed_name_for(stored_name: &str) -> String {
    format!("{DUB_PREFIX}{stored_name}")
}
