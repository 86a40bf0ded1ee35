use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use tracing::{debug, warn};

use super::response::error_from_body;
use super::XmdsMethod;
use crate::error::XmdsError;

/// Schema version assumed when the CMS does not answer the `what` query.
pub const FALLBACK_XMDS_VERSION: u32 = 7;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// After a failed version query, calls use the fallback version for this long.
const VERSION_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Carries a SOAP body to the CMS and returns the raw response body.
///
/// The HTTP implementation is the only one used in production; tests plug in
/// scripted transports.
#[async_trait]
pub trait XmdsTransport: Send + Sync {
    async fn post(&self, method: XmdsMethod, body: String) -> Result<String, XmdsError>;
}

pub struct HttpTransport {
    client: Client,
    cms_url: String,
    version: RwLock<Option<u32>>,
    version_failed_at: Mutex<Option<Instant>>,
}

impl HttpTransport {
    pub fn new(cms_url: impl Into<String>, version: Option<u32>) -> Result<Self, XmdsError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            cms_url: cms_url.into().trim_end_matches('/').to_string(),
            version: RwLock::new(version.filter(|v| *v > 0)),
            version_failed_at: Mutex::new(None),
        })
    }

    pub fn cms_url(&self) -> &str {
        &self.cms_url
    }

    /// Configured schema version, or whatever `xmds.php?what` reports.
    /// A successful answer is remembered. A failed one makes calls use
    /// [`FALLBACK_XMDS_VERSION`] without asking again for [`VERSION_RETRY_AFTER`].
    pub async fn schema_version(&self) -> u32 {
        let configured = *self.version.read();
        if let Some(v) = configured {
            return v;
        }
        let failed_at = *self.version_failed_at.lock();
        if failed_at.is_some_and(|at| at.elapsed() < VERSION_RETRY_AFTER) {
            return FALLBACK_XMDS_VERSION;
        }

        let url = format!("{}/xmds.php?what", self.cms_url);
        let answered = match self.client.get(&url).send().await {
            Ok(resp) => resp.text().await.ok().and_then(|t| t.trim().parse::<u32>().ok()),
            Err(e) => {
                warn!("xmds schema query failed: {e}");
                None
            }
        };

        match answered.filter(|v| *v > 0) {
            Some(v) => {
                debug!(version = v, "xmds schema version");
                *self.version.write() = Some(v);
                *self.version_failed_at.lock() = None;
                v
            }
            None => {
                debug!(fallback = FALLBACK_XMDS_VERSION, "xmds schema answer unusable");
                *self.version_failed_at.lock() = Some(Instant::now());
                FALLBACK_XMDS_VERSION
            }
        }
    }
}

#[async_trait]
impl XmdsTransport for HttpTransport {
    async fn post(&self, method: XmdsMethod, body: String) -> Result<String, XmdsError> {
        let version = self.schema_version().await;
        let url = format!(
            "{}/xmds.php?v={version}&method={}",
            self.cms_url,
            method.query_name()
        );

        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if status.is_success() {
            Ok(text)
        } else {
            debug!(method = method.query_name(), %status, "xmds call rejected");
            Err(error_from_body(&text))
        }
    }
}
