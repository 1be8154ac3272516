//! Announce stage.
//!
//! Each enabled channel is an independent capability call; channel failures
//! are logged through the reporter and never abort the run. The webhook
//! channel posts a JSON payload with an optional HMAC-SHA256 signature
//! header so receivers can authenticate the notification.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::cancel::CancelToken;
use crate::config::{CommandAnnounceSpec, Config, WebhookAnnounceSpec};
use crate::context::TemplateContext;
use crate::error::ReleaseError;
use crate::pipeline::Reporter;
use crate::process;

const SIGNATURE_HEADER: &str = "X-Shipwright-Signature";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Notification capability.
pub trait Announcer: Send + Sync {
    fn name(&self) -> String;
    fn announce(&self, token: &CancelToken, tctx: &TemplateContext) -> Result<()>;
}

/// Run every enabled channel. Failures are warnings, never errors.
pub fn run_announcers(
    config: &Config,
    tctx: &TemplateContext,
    token: &CancelToken,
    reporter: &Arc<Mutex<dyn Reporter + Send>>,
) -> Result<(), ReleaseError> {
    if config.announce.skip {
        return Ok(());
    }

    let mut channels: Vec<Box<dyn Announcer>> = Vec::new();
    if let Some(webhook) = &config.announce.webhook {
        channels.push(Box::new(WebhookAnnouncer::new(webhook.clone())));
    }
    if let Some(command) = &config.announce.command {
        channels.push(Box::new(CommandAnnouncer::new(command.clone())));
    }

    for channel in channels {
        token.checkpoint()?;
        if let Err(e) = channel.announce(token, tctx) {
            reporter
                .lock()
                .unwrap()
                .warn(&format!("announce via {} failed: {e:#}", channel.name()));
        }
    }
    Ok(())
}

pub struct WebhookAnnouncer {
    spec: WebhookAnnounceSpec,
    client: reqwest::blocking::Client,
}

impl WebhookAnnouncer {
    pub fn new(spec: WebhookAnnounceSpec) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("shipwright/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client with static config");
        Self { spec, client }
    }
}

impl Announcer for WebhookAnnouncer {
    fn name(&self) -> String {
        "webhook".to_string()
    }

    fn announce(&self, _token: &CancelToken, tctx: &TemplateContext) -> Result<()> {
        let message = tctx.apply(&self.spec.message_template)?;
        let payload = serde_json::json!({
            "project": tctx.get("ProjectName").unwrap_or_default(),
            "version": tctx.get("Version").unwrap_or_default(),
            "tag": tctx.get("Tag").unwrap_or_default(),
            "message": message,
        });
        let body = serde_json::to_string(&payload).context("failed to serialize payload")?;

        let mut request = self
            .client
            .post(&self.spec.url)
            .header("Content-Type", self.spec.content_type.clone())
            .body(body.clone());
        for (key, value) in &self.spec.headers {
            request = request.header(key, value);
        }
        if !self.spec.secret_env.is_empty()
            && let Ok(secret) = std::env::var(&self.spec.secret_env)
        {
            request = request.header(SIGNATURE_HEADER, sign_payload(&secret, &body));
        }

        let response = request
            .send()
            .with_context(|| format!("failed to reach {}", self.spec.url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook returned {status}");
        }
        Ok(())
    }
}

/// HMAC-SHA256 of the payload, hex-encoded with the scheme prefix.
fn sign_payload(secret: &str, payload: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

pub struct CommandAnnouncer {
    spec: CommandAnnounceSpec,
}

impl CommandAnnouncer {
    pub fn new(spec: CommandAnnounceSpec) -> Self {
        Self { spec }
    }
}

impl Announcer for CommandAnnouncer {
    fn name(&self) -> String {
        format!("command ({})", self.spec.cmd)
    }

    fn announce(&self, token: &CancelToken, tctx: &TemplateContext) -> Result<()> {
        let mut args = Vec::with_capacity(self.spec.args.len());
        for arg in &self.spec.args {
            args.push(tctx.apply(arg)?);
        }
        let out =
            process::run_command(&self.spec.cmd, &args, None, &BTreeMap::new(), None, token)?;
        if !out.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.spec.cmd,
                out.exit_code,
                process::tail(&out.stderr, 10)
            );
        }
        Ok(())
    }
}
