use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::SourceIngester;
use crate::error::IngestError;
use crate::schedule::types::{StagedFile, Task};
use crate::storage::BlobStore;

const PAGE_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct Resource {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    /// direct download link, only present for files
    file: Option<String>,
    #[serde(rename = "_embedded")]
    embedded: Option<ResourceList>,
}

#[derive(Debug, Deserialize)]
struct ResourceList {
    #[serde(default)]
    items: Vec<Resource>,
}

/// Ingester for public Yandex.Disk folders (or single public files).
///
/// `remote_path` of the task is the public link. Nested directories are not
/// descended into.
pub struct YaDiskIngester {
    client: Client,
    api_base: String,
    token: Option<String>,
    blobs: BlobStore,
}

impl YaDiskIngester {
    pub fn new(api_base: &str, token: Option<String>, blobs: BlobStore) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(30 * 60))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            blobs,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("OAuth {}", token)),
            None => request,
        }
    }

    async fn list_page(&self, public_key: &str, offset: usize) -> Result<Resource, IngestError> {
        let url = format!("{}/v1/disk/public/resources", self.api_base);
        let request = self.client.get(&url).query(&[
            ("public_key", public_key.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
            ("offset", offset.to_string()),
        ]);

        let response = self.authorized(request).send().await.map_err(|e| {
            IngestError::SourceUnavailable(format!("{}: {}", public_key, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::SourceUnavailable(format!(
                "{} returned {}",
                public_key, status
            )));
        }

        response
            .json::<Resource>()
            .await
            .map_err(|source| IngestError::InvalidListing {
                path: public_key.to_string(),
                source,
            })
    }

    /// Every downloadable file under `public_key`, in listing order.
    async fn list_files(&self, public_key: &str) -> Result<Vec<(String, String)>, IngestError> {
        let mut files = Vec::new();
        let mut offset = 0;

        loop {
            let resource = self.list_page(public_key, offset).await?;
            if resource.kind == "file" {
                if let Some(url) = resource.file {
                    files.push((resource.name, url));
                }
                return Ok(files);
            }

            let items = resource.embedded.map(|list| list.items).unwrap_or_default();
            let page_len = items.len();
            for item in items {
                match (item.kind.as_str(), item.file) {
                    ("file", Some(url)) => files.push((item.name, url)),
                    _ => debug!("Skipping {} ({})", item.name, item.kind),
                }
            }

            if page_len < PAGE_LIMIT {
                return Ok(files);
            }
            offset += page_len;
        }
    }

    async fn download(&self, name: &str, url: &str) -> Result<StagedFile, IngestError> {
        let download_error = |source| IngestError::Download {
            name: name.to_string(),
            source,
        };

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(download_error)?;
        let bytes = response.bytes().await.map_err(download_error)?;

        self.blobs
            .stage(name, &bytes)
            .await
            .map_err(|source| IngestError::Stage {
                name: name.to_string(),
                source,
            })
    }
}

#[async_trait]
impl SourceIngester for YaDiskIngester {
    async fn ingest(&self, task: &Task) -> Result<Vec<StagedFile>, IngestError> {
        let public_key = task.remote_path.trim();
        if public_key.is_empty() {
            return Err(IngestError::SourceUnavailable(
                "task has no remote path".to_string(),
            ));
        }

        let files = self.list_files(public_key).await?;
        info!("Found {} remote files for task {}", files.len(), task.id);

        let mut staged = Vec::with_capacity(files.len());
        for (name, url) in &files {
            match self.download(name, url).await {
                Ok(file) => {
                    debug!("Downloaded {} ({} bytes)", name, file.size);
                    staged.push(file);
                }
                Err(e) => {
                    warn!("Download of {} failed, dropping {} staged files", name, staged.len());
                    for file in &staged {
                        self.blobs.remove(&file.path).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(staged)
    }
}
