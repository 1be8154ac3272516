//! Publish stage: fan artifacts out to publishing capabilities.
//!
//! Publishers are enabled by configuration presence and run in a fixed
//! inter-kind order (release host, then docker image pushes, then upload
//! publishers) so that URLs referenced by later publishers already exist.
//! The first failure aborts the stage.

use std::fs::File;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::config::{Config, ReleaseHostSpec, UploadSpec};
use crate::context::TemplateContext;
use crate::docker;
use crate::error::ReleaseError;
use crate::registry::ArtifactRegistry;
use crate::types::{Artifact, ArtifactKind};

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Publishing capability. Each publisher consumes the full snapshot and
/// performs its own filtering.
pub trait Publisher: Send + Sync {
    fn name(&self) -> String;
    fn publish(
        &self,
        token: &CancelToken,
        artifacts: &[Artifact],
        tctx: &TemplateContext,
    ) -> Result<()>;
}

/// Run the publish stage in its fixed order. Any failure aborts.
pub fn run_publishers(
    config: &Config,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    token: &CancelToken,
) -> Result<()> {
    let snapshot = registry.list();

    if let Some(spec) = &config.release {
        token.checkpoint()?;
        let publisher = ReleaseHostPublisher::from_spec(spec.clone())?;
        publisher
            .publish(token, &snapshot, tctx)
            .map_err(|e| publish_error(&publisher.name(), e))?;
    }

    token.checkpoint()?;
    docker::push_images(registry, token)?;

    for spec in &config.uploads {
        token.checkpoint()?;
        let publisher = UploadPublisher::new(spec.clone());
        publisher
            .publish(token, &snapshot, tctx)
            .map_err(|e| publish_error(&publisher.name(), e))?;
    }
    Ok(())
}

fn publish_error(publisher: &str, e: anyhow::Error) -> anyhow::Error {
    // Keep cancellation typed so it maps to the right exit code.
    if e.downcast_ref::<ReleaseError>()
        .is_some_and(|r| matches!(r, ReleaseError::Cancelled(_)))
    {
        return e;
    }
    anyhow::Error::new(ReleaseError::Publish(format!("{publisher}: {e:#}")))
}

/// GitHub-style release host publisher: create (or reuse) the release for
/// the tag, then upload the uploadable artifacts as assets.
#[derive(Debug)]
pub struct ReleaseHostPublisher {
    spec: ReleaseHostSpec,
    api_token: String,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct CreatedRelease {
    id: u64,
}

impl ReleaseHostPublisher {
    pub fn from_spec(spec: ReleaseHostSpec) -> Result<Self> {
        let env_key = spec.host.token_env();
        let api_token = std::env::var(env_key)
            .map_err(|_| ReleaseError::Precondition(format!("{env_key} is not set")))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("shipwright/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build release host HTTP client")?;
        Ok(Self {
            spec,
            api_token,
            client,
        })
    }

    fn api_url(&self) -> String {
        self.spec
            .api_url
            .clone()
            .unwrap_or_else(|| self.spec.host.default_api_url().to_string())
    }

    fn create_release(&self, tctx: &TemplateContext) -> Result<CreatedRelease> {
        let tag = tctx.get("Tag").unwrap_or_default();
        let name = tctx.apply(&self.spec.name_template)?;
        let body = tctx.get("Changelog").unwrap_or_default();

        let url = format!(
            "{}/repos/{}/{}/releases",
            self.api_url(),
            self.spec.owner,
            self.spec.name
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({
                "tag_name": tag,
                "name": name,
                "body": body,
                "draft": self.spec.draft,
                "prerelease": self.spec.prerelease,
            }))
            .send()
            .with_context(|| format!("failed to reach {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            anyhow::bail!("release creation returned {status}: {text}");
        }
        response.json().context("failed to parse release response")
    }

    fn upload_asset(&self, release: &CreatedRelease, artifact: &Artifact) -> Result<()> {
        let url = format!(
            "{}/repos/{}/{}/releases/{}/assets?name={}",
            upload_base(&self.api_url()),
            self.spec.owner,
            self.spec.name,
            release.id,
            artifact.name
        );
        let file = File::open(&artifact.path)
            .with_context(|| format!("failed to open {}", artifact.path.display()))?;
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .header("Content-Type", "application/octet-stream")
            .body(file)
            .send()
            .with_context(|| format!("failed to upload {}", artifact.name))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            anyhow::bail!("upload of {} returned {status}: {text}", artifact.name);
        }
        Ok(())
    }
}

/// Asset uploads go to the dedicated upload host on github.com; self-hosted
/// instances serve both from the same base.
fn upload_base(api_url: &str) -> String {
    if api_url == "https://api.github.com" {
        "https://uploads.github.com".to_string()
    } else {
        api_url.to_string()
    }
}

fn uploadable(artifact: &Artifact) -> bool {
    matches!(
        artifact.kind,
        ArtifactKind::Archive
            | ArtifactKind::LinuxPackage
            | ArtifactKind::PlatformPackage
            | ArtifactKind::Checksum
            | ArtifactKind::Signature
            | ArtifactKind::Sbom
    )
}

impl Publisher for ReleaseHostPublisher {
    fn name(&self) -> String {
        format!("release host ({:?})", self.spec.host)
    }

    fn publish(
        &self,
        token: &CancelToken,
        artifacts: &[Artifact],
        tctx: &TemplateContext,
    ) -> Result<()> {
        let release = self.create_release(tctx)?;
        for artifact in artifacts.iter().filter(|a| uploadable(a)) {
            token.checkpoint()?;
            self.upload_asset(&release, artifact)?;
        }
        Ok(())
    }
}

/// HTTP-PUT upload publisher for package-manager-style endpoints. The
/// target URL is templated per artifact; credentials come from
/// `UPLOAD_<ID>_TOKEN` with the configured username.
pub struct UploadPublisher {
    spec: UploadSpec,
    client: reqwest::blocking::Client,
}

impl UploadPublisher {
    pub fn new(spec: UploadSpec) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("shipwright/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client with static config");
        Self { spec, client }
    }

    fn token_env(&self) -> String {
        format!(
            "UPLOAD_{}_TOKEN",
            self.spec.id.to_uppercase().replace('-', "_")
        )
    }
}

impl Publisher for UploadPublisher {
    fn name(&self) -> String {
        format!("upload ({})", self.spec.id)
    }

    fn publish(
        &self,
        token: &CancelToken,
        artifacts: &[Artifact],
        tctx: &TemplateContext,
    ) -> Result<()> {
        let secret = std::env::var(self.token_env()).ok();
        let selected: Vec<&Artifact> = artifacts
            .iter()
            .filter(|a| {
                if self.spec.ids.is_empty() {
                    matches!(
                        a.kind,
                        ArtifactKind::Archive
                            | ArtifactKind::LinuxPackage
                            | ArtifactKind::PlatformPackage
                            | ArtifactKind::Checksum
                    )
                } else {
                    a.extra
                        .get("id")
                        .and_then(|v| v.as_str())
                        .or(a.build_id.as_deref())
                        .map(|id| self.spec.ids.iter().any(|allowed| allowed == id))
                        .unwrap_or(false)
                }
            })
            .collect();

        for artifact in selected {
            token.checkpoint()?;
            let url = tctx
                .with_var("ArtifactName", &artifact.name)
                .apply(&self.spec.target)?;
            let file = File::open(&artifact.path)
                .with_context(|| format!("failed to open {}", artifact.path.display()))?;

            let mut request = self.client.put(&url).body(file);
            if let Some(secret) = &secret {
                request = request.basic_auth(&self.spec.username, Some(secret));
            }
            let response = request
                .send()
                .with_context(|| format!("failed to upload {} to {url}", artifact.name))?;
            let status = response.status();
            if !status.is_success() {
                anyhow::bail!("upload of {} returned {status}", artifact.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Target;

    #[test]
    fn uploadable_excludes_raw_binaries_and_images() {
        let archive = Artifact::new("a.tar.gz", "/d/a.tar.gz", ArtifactKind::Archive);
        let binary = Artifact::new("a", "/d/a", ArtifactKind::Binary)
            .with_target(Target::new("linux", "amd64"));
        let image = Artifact::new("img:v1", "img:v1", ArtifactKind::DockerImage);
        let checksum = Artifact::new("sums", "/d/sums", ArtifactKind::Checksum);

        assert!(uploadable(&archive));
        assert!(uploadable(&checksum));
        assert!(!uploadable(&binary));
        assert!(!uploadable(&image));
    }

    #[test]
    fn upload_base_switches_only_for_github_dot_com() {
        assert_eq!(upload_base("https://api.github.com"), "https://uploads.github.com");
        assert_eq!(
            upload_base("https://git.acme.dev/api/v1"),
            "https://git.acme.dev/api/v1"
        );
    }

    #[test]
    fn upload_token_env_is_derived_from_the_spec_id() {
        let publisher = UploadPublisher::new(UploadSpec {
            id: "apt-mirror".to_string(),
            target: "https://pkg.acme.dev/{{ ArtifactName }}".to_string(),
            ..UploadSpec::default()
        });
        assert_eq!(publisher.token_env(), "UPLOAD_APT_MIRROR_TOKEN");
    }

    #[test]
    fn missing_host_token_is_a_precondition_error() {
        temp_env::with_var_unset("GITHUB_TOKEN", || {
            let spec = ReleaseHostSpec {
                owner: "acme".to_string(),
                name: "widget".to_string(),
                ..ReleaseHostSpec::default()
            };
            let err = ReleaseHostPublisher::from_spec(spec).unwrap_err();
            let release = err.downcast_ref::<ReleaseError>().expect("typed");
            assert!(matches!(release, ReleaseError::Precondition(_)));
        });
    }
}
