use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::debug;

use crate::xmds::XmdsClient;

const HTTP_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Where the bytes of a required file come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Plain HTTP(S) download.
    Http(String),
    /// Widget HTML rendered by the CMS (`GetResource`).
    Resource { layout_id: i64, region_id: String, media_id: String },
}

impl FileSource {
    /// Text stored in the `url` column.
    pub fn describe(&self) -> String {
        match self {
            FileSource::Http(url) => url.clone(),
            FileSource::Resource { layout_id, region_id, media_id } => {
                format!("xmds:getResource/{layout_id}/{region_id}/{media_id}")
            }
        }
    }
}

/// Network side of the content cache.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, source: &FileSource) -> Result<Bytes>;
}

/// Production fetcher: reqwest for http files, XMDS for resources.
pub struct RemoteFetcher {
    http: Client,
    xmds: XmdsClient,
}

impl RemoteFetcher {
    pub fn new(xmds: XmdsClient) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_DOWNLOAD_TIMEOUT)
            .build()
            .context("failed to build download client")?;
        Ok(Self { http, xmds })
    }
}

#[async_trait]
impl Fetcher for RemoteFetcher {
    async fn fetch(&self, source: &FileSource) -> Result<Bytes> {
        match source {
            FileSource::Http(url) => {
                if url.is_empty() {
                    return Err(anyhow!("required file has no download path"));
                }
                debug!(url = %url, "downloading");
                let resp = self.http.get(url).send().await?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(anyhow!("download failed with HTTP {status}"));
                }
                Ok(resp.bytes().await?)
            }
            FileSource::Resource { layout_id, region_id, media_id } => {
                let html = self.xmds.get_resource(*layout_id, region_id, media_id).await?;
                Ok(Bytes::from(html))
            }
        }
    }
}
