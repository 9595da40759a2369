//! Package artifacts: where they come from and which one a device gets.

use anyhow::{Context, Result};
use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub url: String,
}

#[async_trait]
pub trait PackageSource: Send + Sync {
    async fn list_artifacts(&self) -> Result<Vec<Artifact>>;
    async fn download(&self, artifact: &Artifact) -> Result<Vec<u8>>;
}

/// Release manifest in the GitHub releases API format: either one release
/// object or an array of releases, newest first.
pub struct GithubReleaseSource {
    manifest_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Manifest {
    One(Release),
    Many(Vec<Release>),
}

impl GithubReleaseSource {
    pub fn new(manifest_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("camdeploy/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            manifest_url: manifest_url.into(),
            client,
        }
    }
}

#[async_trait]
impl PackageSource for GithubReleaseSource {
    async fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        let resp = self
            .client
            .get(&self.manifest_url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("Failed to fetch release manifest")?;

        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "Release manifest returned error: {}",
                resp.status()
            ));
        }

        let manifest: Manifest = resp
            .json()
            .await
            .context("Failed to parse release manifest")?;
        let release = match manifest {
            Manifest::One(release) => Some(release),
            Manifest::Many(releases) => releases.into_iter().find(|r| !r.draft),
        }
        .context("Release manifest lists no published release")?;

        Ok(release
            .assets
            .into_iter()
            .map(|a| Artifact {
                name: a.name,
                url: a.browser_download_url,
            })
            .collect())
    }

    async fn download(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        tracing::info!("Downloading {} from {}", artifact.name, artifact.url);
        let resp = self
            .client
            .get(&artifact.url)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", artifact.name))?;

        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "Download of {} returned error: {}",
                artifact.name,
                resp.status()
            ));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Package files in a local directory; `url` is the file path.
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PackageSource for DirectorySource {
    async fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read package directory {:?}", self.dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "eap") {
                artifacts.push(Artifact {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    url: path.display().to_string(),
                });
            }
        }
        Ok(artifacts)
    }

    async fn download(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        tokio::fs::read(&artifact.url)
            .await
            .with_context(|| format!("Failed to read {}", artifact.url))
    }
}

/// Every artifact whose name contains both the architecture and OS tokens.
pub fn match_artifacts<'a>(
    artifacts: &'a [Artifact],
    architecture: &str,
    os_token: &str,
) -> Vec<&'a Artifact> {
    let arch = architecture.to_ascii_lowercase();
    let os = os_token.to_ascii_lowercase();
    artifacts
        .iter()
        .filter(|a| {
            let name = a.name.to_ascii_lowercase();
            name.contains(&arch) && name.contains(&os)
        })
        .collect()
}

/// Deterministic choice among candidates: highest embedded version, then the
/// lexicographically greatest name.
pub fn select_artifact<'a>(candidates: &[&'a Artifact]) -> Option<&'a Artifact> {
    let chosen = candidates
        .iter()
        .copied()
        .max_by(|a, b| {
            embedded_version(&a.name)
                .cmp(&embedded_version(&b.name))
                .then_with(|| a.name.cmp(&b.name))
        })?;

    if candidates.len() > 1 {
        tracing::warn!(
            "{} packages match; chose {} from [{}]",
            candidates.len(),
            chosen.name,
            candidates
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Some(chosen)
}

/// First `X.Y.Z` or `X_Y_Z` run of digits in a file name.
pub fn embedded_version(name: &str) -> Option<Version> {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() && (i == 0 || !bytes[i - 1].is_ascii_digit()) {
            if let Some(version) = version_at(&name[i..]) {
                return Some(version);
            }
        }
        i += 1;
    }
    None
}

fn version_at(s: &str) -> Option<Version> {
    let mut parts = [0u64; 3];
    let mut rest = s;
    let mut separator = None;
    for (index, part) in parts.iter_mut().enumerate() {
        if index > 0 {
            let sep = rest.chars().next()?;
            if !(sep == '.' || sep == '_') || separator.is_some_and(|s| s != sep) {
                return None;
            }
            separator = Some(sep);
            rest = &rest[1..];
        }
        let len = rest.bytes().take_while(u8::is_ascii_digit).count();
        if len == 0 {
            return None;
        }
        *part = rest[..len].parse().ok()?;
        rest = &rest[len..];
    }
    Some(Version::new(parts[0], parts[1], parts[2]))
}
