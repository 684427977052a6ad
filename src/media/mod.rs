//! Media side channel
//!
//! Generated media must never be silently lost. [`MediaSideChannel::persist`]
//! tries a remote store first, then a local store, and finally embeds the
//! bytes as a `data:` URI, which cannot fail.

pub mod data_uri;
pub mod job;
pub mod store;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::conversation::MediaRef;
use crate::error::Result;

pub use job::{GeneratedMedia, GenerationJob, JobPolicy, JobStatus};
pub use store::{FsMediaStore, MediaStore};

/// Per-mime byte ceilings applied to downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaLimits {
    /// Ceiling for `image/*`
    pub image: usize,
    /// Ceiling for `video/*`
    pub video: usize,
    /// Ceiling for `audio/*`
    pub audio: usize,
    /// Ceiling for everything else
    pub other: usize,
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self {
            image: 20 * 1024 * 1024,
            video: 100 * 1024 * 1024,
            audio: 25 * 1024 * 1024,
            other: 10 * 1024 * 1024,
        }
    }
}

impl MediaLimits {
    /// Byte ceiling for `mime_type`
    ///
    /// # Examples
    ///
    /// ```
    /// use forkchat::media::MediaLimits;
    ///
    /// let limits = MediaLimits::default();
    /// assert_eq!(limits.for_mime("image/png"), 20 * 1024 * 1024);
    /// assert_eq!(limits.for_mime("application/pdf"), 10 * 1024 * 1024);
    /// ```
    pub fn for_mime(&self, mime_type: &str) -> usize {
        match mime_type.split('/').next().unwrap_or_default() {
            "image" => self.image,
            "video" => self.video,
            "audio" => self.audio,
            _ => self.other,
        }
    }
}

/// Which tier ended up holding the media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTier {
    /// Remote store upload succeeded
    Remote,
    /// Remote unavailable or failed; stored locally
    Local,
    /// Both stores failed; bytes embedded as a `data:` URI
    Inline,
}

/// Result of [`MediaSideChannel::persist`]
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedMedia {
    /// Reference to attach to the message
    pub media: MediaRef,
    /// Tier that accepted the bytes
    pub tier: MediaTier,
}

/// Persists generated media with tiered fallback
#[derive(Clone, Default)]
pub struct MediaSideChannel {
    remote: Option<Arc<dyn MediaStore>>,
    local: Option<Arc<dyn MediaStore>>,
    policy: JobPolicy,
}

impl MediaSideChannel {
    /// Creates a side channel with no stores; everything is inlined
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the remote store
    pub fn with_remote(mut self, store: Arc<dyn MediaStore>) -> Self {
        self.remote = Some(store);
        self
    }

    /// Sets the local store
    pub fn with_local(mut self, store: Arc<dyn MediaStore>) -> Self {
        self.local = Some(store);
        self
    }

    /// Sets the generation job polling bounds
    pub fn with_job_policy(mut self, policy: JobPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Local store, used for reading user attachments
    pub fn local_store(&self) -> Option<&Arc<dyn MediaStore>> {
        self.local.as_ref()
    }

    /// Stores `bytes` through the first tier that accepts them
    pub async fn persist(&self, bytes: &[u8], mime_type: &str) -> PersistedMedia {
        if let Some(remote) = &self.remote {
            match remote.upload(bytes, mime_type).await {
                Ok(url) => {
                    return PersistedMedia {
                        media: MediaRef::new(url, mime_type),
                        tier: MediaTier::Remote,
                    }
                }
                Err(e) => tracing::warn!("Remote media upload failed, falling back: {}", e),
            }
        }

        if let Some(local) = &self.local {
            match local.upload(bytes, mime_type).await {
                Ok(path) => {
                    return PersistedMedia {
                        media: MediaRef::new(path, mime_type),
                        tier: MediaTier::Local,
                    }
                }
                Err(e) => tracing::warn!("Local media store failed, inlining: {}", e),
            }
        }

        PersistedMedia {
            media: MediaRef::new(data_uri::encode(bytes, mime_type), mime_type),
            tier: MediaTier::Inline,
        }
    }

    /// Polls a generation job to completion and persists its output
    ///
    /// Returns `Ok(None)` when cancelled.
    pub async fn await_job(
        &self,
        job: &mut dyn GenerationJob,
        cancel: &CancellationToken,
    ) -> Result<Option<PersistedMedia>> {
        match job::poll_until_done(job, self.policy, cancel).await? {
            Some(output) => Ok(Some(self.persist(&output.bytes, &output.mime_type).await)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for MediaSideChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSideChannel")
            .field("remote", &self.remote.is_some())
            .field("local", &self.local.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}
