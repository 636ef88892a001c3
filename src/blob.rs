//! Blob-store collaborator
//!
//! Uploaded CSVs live in an external object store; the gateway only keeps
//! metadata. [`BlobStore`] is the seam: [`HttpBlobStore`] talks to a
//! signed-URL HTTP service, [`MemoryBlobStore`] backs tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::domain::FileId;
use crate::error::{GatewayError, GatewayResult};

/// External object store with signed-URL read access
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the raw bytes of an uploaded file
    async fn put(&self, file_id: FileId, bytes: Bytes) -> GatewayResult<()>;

    /// Issues a time-limited URL from which the bytes can be read
    async fn signed_url(&self, file_id: FileId) -> GatewayResult<String>;

    /// Reads the bytes behind a signed URL
    async fn fetch(&self, signed_url: &str) -> GatewayResult<Bytes>;

    /// Removes the stored bytes
    async fn delete(&self, file_id: FileId) -> GatewayResult<()>;

    /// Reachability probe for the startup checks
    async fn ping(&self) -> GatewayResult<()>;
}

/// Signed-URL HTTP object store
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBlobStore {
    /// Client for the configured blob service
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn object_url(&self, file_id: FileId) -> String {
        format!("{}/objects/{file_id}", self.base_url)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, file_id: FileId, bytes: Bytes) -> GatewayResult<()> {
        let response = self
            .client
            .put(self.object_url(file_id))
            .body(bytes)
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("blob upload failed: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::internal(format!(
                "blob upload failed with status {}",
                response.status()
            )))
        }
    }

    async fn signed_url(&self, file_id: FileId) -> GatewayResult<String> {
        let response = self
            .client
            .post(format!("{}/sign", self.object_url(file_id)))
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("signing failed: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound { entity: "file" });
        }
        if !response.status().is_success() {
            return Err(GatewayError::internal(format!(
                "signing failed with status {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| GatewayError::internal(format!("signing failed: {e}")))
    }

    async fn fetch(&self, signed_url: &str) -> GatewayResult<Bytes> {
        let response = self
            .client
            .get(signed_url)
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("blob fetch failed: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound { entity: "file" });
        }
        if !response.status().is_success() {
            return Err(GatewayError::internal(format!(
                "blob fetch failed with status {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| GatewayError::internal(format!("blob fetch failed: {e}")))
    }

    async fn delete(&self, file_id: FileId) -> GatewayResult<()> {
        let _ = self
            .client
            .delete(self.object_url(file_id))
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("blob delete failed: {e}")))?;
        Ok(())
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("blob store unreachable: {e}")))?;
        Ok(())
    }
}

/// In-memory object store for tests and development
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<FileId, Bytes>,
}

impl MemoryBlobStore {
    const URL_PREFIX: &'static str = "memory://";

    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, file_id: FileId, bytes: Bytes) -> GatewayResult<()> {
        self.objects.insert(file_id, bytes);
        Ok(())
    }

    async fn signed_url(&self, file_id: FileId) -> GatewayResult<String> {
        if self.objects.contains_key(&file_id) {
            Ok(format!("{}{file_id}", Self::URL_PREFIX))
        } else {
            Err(GatewayError::NotFound { entity: "file" })
        }
    }

    async fn fetch(&self, signed_url: &str) -> GatewayResult<Bytes> {
        let raw_id = signed_url
            .strip_prefix(Self::URL_PREFIX)
            .ok_or(GatewayError::NotFound { entity: "file" })?;
        let file_id = raw_id
            .parse::<uuid::Uuid>()
            .map(FileId::new)
            .map_err(|_| GatewayError::NotFound { entity: "file" })?;
        self.objects
            .get(&file_id)
            .map(|entry| entry.value().clone())
            .ok_or(GatewayError::NotFound { entity: "file" })
    }

    async fn delete(&self, file_id: FileId) -> GatewayResult<()> {
        self.objects.remove(&file_id);
        Ok(())
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}
