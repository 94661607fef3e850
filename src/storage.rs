use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client,
};
use aws_smithy_types::byte_stream::ByteStream;
use bytes::Bytes;

use crate::config::StorageConfig;

/// Blob storage addressed by public URL.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `body` under `key` and returns its public URL.
    async fn upload(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<String>;

    /// Deletes the object behind `url`. Deleting a missing object succeeds.
    async fn delete_by_url(&self, url: &str) -> anyhow::Result<()>;
}

/// Maps object keys to `<base>/<bucket>/<key>` URLs and back.
#[derive(Debug, Clone)]
pub struct UrlScheme {
    prefix: String,
}

impl UrlScheme {
    pub fn new(public_url: &str, bucket: &str) -> Self {
        Self {
            prefix: format!("{}/{}/", public_url.trim_end_matches('/'), bucket),
        }
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn key_for<'a>(&self, url: &'a str) -> anyhow::Result<&'a str> {
        anyhow::ensure!(!url.is_empty(), "missing object url");
        let key = url
            .strip_prefix(&self.prefix)
            .with_context(|| format!("url {url} does not belong to {}", self.prefix))?;
        anyhow::ensure!(!key.is_empty(), "url {url} has no object key");
        Ok(key)
    }
}

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    urls: UrlScheme,
}

impl S3ObjectStore {
    pub async fn new(cfg: &StorageConfig) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .credentials_provider(Credentials::new(
                &cfg.access_key,
                &cfg.secret_key,
                None,
                None,
                "static",
            ))
            .endpoint_url(&cfg.endpoint)
            .load()
            .await;

        let conf = S3ConfigBuilder::from(&shared)
            .endpoint_url(&cfg.endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(conf),
            bucket: cfg.bucket.clone(),
            urls: UrlScheme::new(&cfg.public_url, &cfg.bucket),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("s3 put_object")?;
        Ok(self.urls.url_for(key))
    }

    async fn delete_by_url(&self, url: &str) -> anyhow::Result<()> {
        let key = self.urls.key_for(url)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("s3 delete_object")?;
        Ok(())
    }
}

/// In-process object store; keeps blobs in a map.
pub struct MemoryObjectStore {
    urls: UrlScheme,
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    failing: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new(public_url: &str, bucket: &str) -> Self {
        Self {
            urls: UrlScheme::new(public_url, bucket),
            objects: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes uploads and deletes fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contains_url(&self, url: &str) -> bool {
        match self.urls.key_for(url) {
            Ok(key) => self.lock().contains_key(key),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Bytes, String)>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<String> {
        anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "object store unavailable");
        self.lock()
            .insert(key.to_string(), (body, content_type.to_string()));
        Ok(self.urls.url_for(key))
    }

    async fn delete_by_url(&self, url: &str) -> anyhow::Result<()> {
        anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "object store unavailable");
        let key = self.urls.key_for(url)?;
        self.lock().remove(key);
        Ok(())
    }
}
