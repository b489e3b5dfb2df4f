use async_trait::async_trait;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

/// Blob storage for reply attachments, keyed by the attachment's storage key.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

fn sniff_mime(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".into())
}

// ---------------- Filesystem implementation ----------------

pub struct FsAttachmentStore {
    root: PathBuf,
}

impl FsAttachmentStore {
    pub fn new() -> Self {
        let mut root = std::env::var("RHD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        root.push("attachments");
        Self { root }
    }

    // shard by the first two key chars to keep directories small
    fn path_for(&self, key: &str) -> PathBuf {
        let shard = &key[..key.len().min(2)];
        self.root.join(shard).join(key)
    }
}

impl Default for FsAttachmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AttachmentStore for FsAttachmentStore {
    async fn save(&self, key: &str, _mime: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::Other(e.to_string()))?;
        }
        std::fs::write(&path, bytes).map_err(|e| StoreError::Other(e.to_string()))
    }

    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), StoreError> {
        let path = self.path_for(key);
        let bytes = std::fs::read(&path).map_err(|_| StoreError::NotFound)?;
        let mime = sniff_mime(&bytes);
        Ok((bytes, mime))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Other(e.to_string())),
        }
    }
}

// ---------------- S3 implementation (MinIO compatible) ----------------

pub struct S3AttachmentStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    prefix: String,
}

impl S3AttachmentStore {
    pub async fn new() -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "rhd-attachments".into());
        let endpoint = std::env::var("S3_ENDPOINT")
            .map_err(|_| anyhow::anyhow!("S3_ENDPOINT must be set (MinIO / S3 endpoint)"))?;
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region));
        loader = loader.endpoint_url(endpoint);
        if !access.is_empty() && !secret.is_empty() {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // Path-style addressing: required for MinIO/local endpoints without wildcard DNS
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("initialized S3/MinIO attachment store (path-style addressing)");

        // Ensure bucket exists (create if missing)
        if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
            warn!("head_bucket failed for '{bucket}' (will attempt create): {e:?}");
            let mut attempt = 0u32;
            let max_attempts = 8;
            loop {
                attempt += 1;
                match client.create_bucket().bucket(&bucket).send().await {
                    Ok(_) => {
                        info!("created bucket '{bucket}' (attempt {attempt})");
                        break;
                    }
                    Err(e2) => {
                        if attempt >= max_attempts {
                            error!("create_bucket failed for '{bucket}' after {attempt} attempts: {e2:?}");
                            return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e2}"));
                        }
                        let backoff_ms = 200 * attempt.pow(2);
                        warn!("create_bucket attempt {attempt} failed for '{bucket}': {e2:?} (retrying in {backoff_ms}ms)");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms as u64)).await;
                    }
                }
            }
        }

        Ok(Self {
            bucket,
            client,
            prefix: "attachments".into(),
        })
    }

    fn key_for(&self, key: &str) -> String {
        let shard = &key[..key.len().min(2)];
        format!("{}/{}/{}", self.prefix, shard, key)
    }
}

#[async_trait]
impl AttachmentStore for S3AttachmentStore {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), StoreError> {
        use aws_sdk_s3::primitives::ByteStream;
        let object_key = self.key_for(key);
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(mime);
        if let Err(e) = put.send().await {
            error!("put_object failed key={object_key} bucket={} err={e:?}", self.bucket);
            let hint = if e.to_string().contains("NoSuchBucket") {
                " (bucket missing or not yet propagated)"
            } else if e.to_string().contains("AccessDenied") {
                " (check S3_ACCESS_KEY/S3_SECRET_KEY permissions)"
            } else {
                ""
            };
            return Err(StoreError::Other(format!("{e}{hint}")));
        }
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), StoreError> {
        let object_key = self.key_for(key);
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|_| StoreError::NotFound)?;
        let mime = obj.content_type().map(str::to_string);
        let data = obj
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let bytes = Vec::from(data.into_bytes().as_ref());
        let mime = mime.unwrap_or_else(|| sniff_mime(&bytes));
        Ok((bytes, mime))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let object_key = self.key_for(key);
        // Best-effort delete: treat not found as success
        let _ = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await;
        Ok(())
    }
}

/// Factory used in main: S3/MinIO when S3_ENDPOINT is configured, local
/// filesystem otherwise.
pub async fn build_attachment_store() -> Arc<dyn AttachmentStore> {
    if std::env::var("S3_ENDPOINT").is_ok() {
        match S3AttachmentStore::new().await {
            Ok(store) => return Arc::new(store),
            Err(e) => panic!("failed to initialize S3 attachment store: {e}"),
        }
    }
    info!("using filesystem attachment store");
    Arc::new(FsAttachmentStore::new())
}
