//! Outbound delivery of verification results: operator notifications and
//! evidence upload.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::Serialize;

use crate::config::NotifyConfig;
use crate::error::{Error, Result};
use crate::model::VerificationResultType;

#[derive(Debug, Clone, Serialize)]
pub struct NotificationContext {
    pub asset_key: String,
    pub hostname: String,
    pub snapshot_epoch: i64,
    pub result: VerificationResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub captured_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_sha256: Option<String>,
    pub missing_services: Vec<String>,
    pub missing_applications: Vec<String>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, n: &NotificationContext) -> Result<()>;
}

pub trait EvidenceUploader: Send + Sync {
    fn upload(&self, n: &NotificationContext) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: &NotificationContext) -> Result<()> {
        tracing::info!(
            asset = %n.asset_key,
            snapshot = n.snapshot_epoch,
            result = n.result.as_str(),
            message = n.message.as_deref().unwrap_or(""),
            "verification result"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUploader;

impl EvidenceUploader for NoopUploader {
    fn upload(&self, _n: &NotificationContext) -> Result<()> {
        Ok(())
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    event: &'static str,
    #[serde(flatten)]
    verification: &'a NotificationContext,
}

/// POSTs the notification context as JSON.
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
            token,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, n: &NotificationContext) -> Result<()> {
        let mut req = self.client.post(&self.url).json(&WebhookBody {
            event: "screenshot_verification",
            verification: n,
        });
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t);
        }
        let res = req
            .send()
            .map_err(|e| Error::msg(format!("webhook delivery failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "webhook delivery failed with status {}",
                res.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EvidenceBody<'a> {
    asset: &'a str,
    snapshot: i64,
    result: VerificationResultType,
    captured_at: i64,
    sha256: Option<&'a str>,
    image_base64: String,
}

/// PUTs `{base}/{asset}/{snapshot}` with the screenshot inlined as base64.
pub struct HttpEvidenceUploader {
    client: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpEvidenceUploader {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }
}

impl EvidenceUploader for HttpEvidenceUploader {
    fn upload(&self, n: &NotificationContext) -> Result<()> {
        let Some(path) = n.screenshot_path.as_deref() else {
            tracing::debug!(asset = %n.asset_key, "no screenshot to upload");
            return Ok(());
        };
        let bytes = fs::read(path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        let body = EvidenceBody {
            asset: &n.asset_key,
            snapshot: n.snapshot_epoch,
            result: n.result,
            captured_at: n.captured_at,
            sha256: n.screenshot_sha256.as_deref(),
            image_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
        };
        let url = format!("{}/{}/{}", self.base_url, n.asset_key, n.snapshot_epoch);
        let mut req = self.client.put(url).json(&body);
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t);
        }
        let res = req
            .send()
            .map_err(|e| Error::msg(format!("evidence upload failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "evidence upload failed with status {}",
                res.status()
            )));
        }
        tracing::info!(asset = %n.asset_key, snapshot = n.snapshot_epoch, "uploaded verification evidence");
        Ok(())
    }
}

pub fn from_config(cfg: &NotifyConfig) -> Result<(Arc<dyn Notifier>, Arc<dyn EvidenceUploader>)> {
    let timeout = Duration::from_secs(cfg.timeout_secs);
    let token = cfg.resolved_token();
    let notifier: Arc<dyn Notifier> = match cfg.resolved_webhook_url() {
        Some(url) => Arc::new(WebhookNotifier::new(url, token.clone(), timeout)?),
        None => Arc::new(LogNotifier),
    };
    let uploader: Arc<dyn EvidenceUploader> = match cfg.resolved_upload_url() {
        Some(url) => Arc::new(HttpEvidenceUploader::new(url, token, timeout)?),
        None => Arc::new(NoopUploader),
    };
    Ok((notifier, uploader))
}
