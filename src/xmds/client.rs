use std::sync::Arc;

use base64::Engine as _;
use tracing::debug;

use super::envelope::{self, Field};
use super::response::{parse_resource, parse_success, RegisterDisplay, RequiredFiles};
use super::schedule::Schedule;
use super::transport::XmdsTransport;
use super::XmdsMethod;
use crate::config::{EngineConfig, CLIENT_CODE, CLIENT_TYPE};
use crate::error::XmdsError;

/// Who we are when talking to the CMS.
#[derive(Debug, Clone)]
pub struct XmdsIdentity {
    pub server_key: String,
    pub hardware_key: String,
    pub display_name: String,
    pub client_version: String,
    pub xmr_channel: String,
    pub operating_system: String,
}

impl XmdsIdentity {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            server_key: cfg.cms_key.clone(),
            hardware_key: cfg.hardware_key.clone(),
            display_name: cfg.display_name.clone(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            xmr_channel: cfg.xmr_channel.clone(),
            operating_system: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

/// Typed XMDS calls on top of a transport.
#[derive(Clone)]
pub struct XmdsClient {
    transport: Arc<dyn XmdsTransport>,
    identity: Arc<XmdsIdentity>,
}

impl XmdsClient {
    pub fn new(transport: Arc<dyn XmdsTransport>, identity: XmdsIdentity) -> Self {
        Self { transport, identity: Arc::new(identity) }
    }

    pub fn identity(&self) -> &XmdsIdentity {
        &self.identity
    }

    fn keys(&self) -> [Field<'static>; 2] {
        [
            Field::string("serverKey", self.identity.server_key.clone()),
            Field::string("hardwareKey", self.identity.hardware_key.clone()),
        ]
    }

    async fn call(&self, method: XmdsMethod, extra: Vec<Field<'static>>) -> Result<String, XmdsError> {
        let mut fields = self.keys().to_vec();
        fields.extend(extra);
        let body = envelope::build(method, &fields);
        debug!(method = method.query_name(), "xmds call");
        self.transport.post(method, body).await
    }

    pub async fn register_display(&self) -> Result<RegisterDisplay, XmdsError> {
        let id = &self.identity;
        let body = self
            .call(
                XmdsMethod::RegisterDisplay,
                vec![
                    Field::string("displayName", id.display_name.clone()),
                    Field::string("clientType", CLIENT_TYPE),
                    Field::string("clientVersion", id.client_version.clone()),
                    Field::int("clientCode", CLIENT_CODE),
                    Field::string("macAddress", "n/a"),
                    Field::string("xmrChannel", id.xmr_channel.clone()),
                    Field::string("operatingSystem", id.operating_system.clone()),
                    Field::string("licenceResult", ""),
                ],
            )
            .await?;
        RegisterDisplay::parse(&body)
    }

    pub async fn required_files(&self) -> Result<RequiredFiles, XmdsError> {
        let body = self.call(XmdsMethod::RequiredFiles, Vec::new()).await?;
        RequiredFiles::parse(&body)
    }

    pub async fn schedule(&self) -> Result<Schedule, XmdsError> {
        let body = self.call(XmdsMethod::Schedule, Vec::new()).await?;
        Schedule::parse(&body)
    }

    /// `inventory` is the full `<files>...</files>` document.
    pub async fn media_inventory(&self, inventory: String) -> Result<bool, XmdsError> {
        let body = self
            .call(XmdsMethod::MediaInventory, vec![Field::string("mediaInventory", inventory)])
            .await?;
        parse_success(&body, XmdsMethod::MediaInventory)
    }

    /// `logs` is the full `<logs>...</logs>` document.
    pub async fn submit_log(&self, logs: String) -> Result<bool, XmdsError> {
        let body = self
            .call(XmdsMethod::SubmitLog, vec![Field::string("logXml", logs)])
            .await?;
        parse_success(&body, XmdsMethod::SubmitLog)
    }

    /// `stats` is the full `<records>...</records>` document.
    pub async fn submit_stats(&self, stats: String) -> Result<bool, XmdsError> {
        let body = self
            .call(XmdsMethod::SubmitStats, vec![Field::string("statXml", stats)])
            .await?;
        parse_success(&body, XmdsMethod::SubmitStats)
    }

    /// `status` is a JSON object describing the device.
    pub async fn notify_status(&self, status: String) -> Result<bool, XmdsError> {
        let body = self
            .call(XmdsMethod::NotifyStatus, vec![Field::string("status", status)])
            .await?;
        parse_success(&body, XmdsMethod::NotifyStatus)
    }

    /// Rendered HTML of one widget.
    pub async fn get_resource(
        &self,
        layout_id: i64,
        region_id: &str,
        media_id: &str,
    ) -> Result<String, XmdsError> {
        let body = self
            .call(
                XmdsMethod::GetResource,
                vec![
                    Field::int("layoutId", layout_id),
                    Field::string("regionId", region_id.to_string()),
                    Field::string("mediaId", media_id.to_string()),
                ],
            )
            .await?;
        parse_resource(&body)
    }

    pub async fn submit_screenshot(&self, png: &[u8]) -> Result<bool, XmdsError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        let body = self
            .call(XmdsMethod::SubmitScreenShot, vec![Field::base64("screenShot", encoded)])
            .await?;
        parse_success(&body, XmdsMethod::SubmitScreenShot)
    }
}
