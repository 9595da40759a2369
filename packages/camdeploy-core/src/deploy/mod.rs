//! Device provisioning.
//!
//! A [`DeploymentJob`] walks six stages strictly in order. Each stage checks
//! whether its goal is already met before acting and verifies its effect
//! before the next one starts. Jobs for different devices share nothing but
//! the stateless client and run concurrently through [`deploy_many`].

pub mod license;
mod orchestrator;
pub mod package;
pub mod vapix;

pub use license::{LicenseSigner, NoSigner, RemoteLicenseSigner, StaticLicense};
pub use orchestrator::{DeploySettings, Orchestrator};
pub use package::{
    Artifact, DirectorySource, GithubReleaseSource, PackageSource, match_artifacts,
    select_artifact,
};
pub use vapix::{ApplicationStatus, DeviceInfo, OsFamily};

use crate::auth::DeviceCredentials;
use crate::error::StageError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Provisioning stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    FetchDeviceInfo,
    DeployPackage,
    ActivateLicense,
    EnsureRunning,
    PushConfiguration,
    Validate,
}

impl DeployStage {
    pub const ALL: [DeployStage; 6] = [
        DeployStage::FetchDeviceInfo,
        DeployStage::DeployPackage,
        DeployStage::ActivateLicense,
        DeployStage::EnsureRunning,
        DeployStage::PushConfiguration,
        DeployStage::Validate,
    ];

    /// Step number shown to users. Device info is the preflight step 0.
    pub fn number(&self) -> u8 {
        match self {
            DeployStage::FetchDeviceInfo => 0,
            DeployStage::DeployPackage => 1,
            DeployStage::ActivateLicense => 2,
            DeployStage::EnsureRunning => 3,
            DeployStage::PushConfiguration => 4,
            DeployStage::Validate => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeployStage::FetchDeviceInfo => "Fetch Device Info",
            DeployStage::DeployPackage => "Deploy Package",
            DeployStage::ActivateLicense => "Activate License",
            DeployStage::EnsureRunning => "Ensure Running",
            DeployStage::PushConfiguration => "Push Configuration",
            DeployStage::Validate => "Validate",
        }
    }

    /// e.g. `"Step 2: Activate License"`.
    pub fn label(&self) -> String {
        format!("Step {}: {}", self.number(), self.name())
    }

    /// Slice of the overall progress bar owned by this stage.
    pub fn progress_range(&self) -> (u8, u8) {
        match self {
            DeployStage::FetchDeviceInfo => (0, 10),
            DeployStage::DeployPackage => (10, 40),
            DeployStage::ActivateLicense => (40, 70),
            DeployStage::EnsureRunning => (70, 80),
            DeployStage::PushConfiguration => (80, 90),
            DeployStage::Validate => (90, 100),
        }
    }

    /// Overall percentage for a fraction (0.0..=1.0) of this stage.
    pub fn percent_at(&self, fraction: f32) -> u8 {
        let (start, end) = self.progress_range();
        let span = f32::from(end - start) * fraction.clamp(0.0, 1.0);
        start + span.round() as u8
    }
}

impl std::fmt::Display for DeployStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// How a stage ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    /// The goal was already met; nothing was changed.
    AlreadySatisfied,
    /// A transient device condition was tolerated.
    Recovered(String),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub stage: DeployStage,
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentReport {
    pub ip: String,
    pub device: DeviceInfo,
    /// Package file name, when one was uploaded.
    pub artifact: Option<String>,
    pub stages: Vec<StageRecord>,
    pub elapsed_secs: f64,
}

impl DeploymentReport {
    pub fn outcome(&self, stage: DeployStage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.outcome)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceTarget {
    pub ip: String,
    pub credentials: DeviceCredentials,
}

/// Which package build to install.
#[derive(Debug, Clone)]
pub enum PackageDescriptor {
    /// Resolve from the package source by architecture and OS family.
    Latest,
    /// A specific artifact of the package source.
    Artifact(Artifact),
    /// Package bytes supplied by the caller.
    Inline { name: String, data: Arc<Vec<u8>> },
}

#[derive(Debug, Clone)]
pub struct DeploymentJob {
    pub device: DeviceTarget,
    pub package: PackageDescriptor,
    pub license_key: String,
    /// Pre-signed license; skips the signer when present.
    pub license_xml: Option<String>,
    /// Installer configuration; `Null` skips the push.
    pub config: Value,
    pub current_stage: Option<DeployStage>,
    pub progress_percent: u8,
}

impl DeploymentJob {
    pub fn new(
        ip: impl Into<String>,
        credentials: DeviceCredentials,
        license_key: impl Into<String>,
        config: Value,
    ) -> Self {
        Self {
            device: DeviceTarget {
                ip: ip.into(),
                credentials,
            },
            package: PackageDescriptor::Latest,
            license_key: license_key.into(),
            license_xml: None,
            config,
            current_stage: None,
            progress_percent: 0,
        }
    }

    pub fn with_package(mut self, package: PackageDescriptor) -> Self {
        self.package = package;
        self
    }

    pub fn with_license_xml(mut self, xml: impl Into<String>) -> Self {
        self.license_xml = Some(xml.into());
        self
    }
}

/// Progress updates during a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployProgress {
    pub ip: String,
    pub stage: DeployStage,
    pub stage_label: String,
    pub percent: u8,
    pub message: String,
}

/// Callback type for deployment progress updates
pub type DeployProgressCallback = Arc<dyn Fn(DeployProgress) + Send + Sync>;

/// Waits between device operations.
#[derive(Debug, Clone, Copy)]
pub struct DeployTimings {
    /// After a license upload, before re-reading the license state.
    pub license_settle: Duration,
    /// Between start-status polls.
    pub start_poll: Duration,
    /// Before resending configuration to a restarting application.
    pub config_retry: Duration,
}

impl Default for DeployTimings {
    fn default() -> Self {
        Self {
            license_settle: Duration::from_secs(3),
            start_poll: Duration::from_secs(3),
            config_retry: Duration::from_secs(5),
        }
    }
}

impl DeployTimings {
    pub fn immediate() -> Self {
        Self {
            license_settle: Duration::ZERO,
            start_poll: Duration::ZERO,
            config_retry: Duration::ZERO,
        }
    }
}

/// Result of one job inside [`deploy_many`].
#[derive(Debug)]
pub struct DeployResult {
    pub ip: String,
    pub result: Result<DeploymentReport, StageError>,
}

/// Run independent jobs with at most `concurrency` in flight. Results arrive
/// in completion order.
pub async fn deploy_many(
    orchestrator: &Orchestrator,
    jobs: Vec<DeploymentJob>,
    concurrency: usize,
    on_progress: Option<DeployProgressCallback>,
) -> Vec<DeployResult> {
    tracing::info!(
        "Deploying to {} devices ({} at a time)",
        jobs.len(),
        concurrency.max(1)
    );

    futures::stream::iter(jobs)
        .map(|mut job| {
            let on_progress = on_progress.clone();
            async move {
                let result = orchestrator.run(&mut job, on_progress.as_ref()).await;
                if let Err(e) = &result {
                    tracing::warn!("[{}] deployment failed: {}", job.device.ip, e);
                }
                DeployResult {
                    ip: job.device.ip,
                    result,
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, StageError};

    #[test]
    fn test_stage_labels() {
        assert_eq!(DeployStage::ActivateLicense.label(), "Step 2: Activate License");
        assert_eq!(DeployStage::FetchDeviceInfo.label(), "Step 0: Fetch Device Info");
        assert_eq!(DeployStage::Validate.to_string(), "Step 5: Validate");
    }

    #[test]
    fn test_progress_ranges_cover_zero_to_hundred() {
        let mut expected_start = 0;
        for stage in DeployStage::ALL {
            let (start, end) = stage.progress_range();
            assert_eq!(start, expected_start);
            assert!(end > start);
            expected_start = end;
        }
        assert_eq!(expected_start, 100);
        assert_eq!(DeployStage::DeployPackage.percent_at(0.5), 25);
        assert_eq!(DeployStage::Validate.percent_at(2.0), 100);
    }

    #[test]
    fn test_stage_error_display_names_stage() {
        let err = StageError::verification(DeployStage::ActivateLicense, "License=Invalid");
        assert_eq!(err.to_string(), "Step 2: Activate License failed: License=Invalid");

        let err = StageError::device(
            DeployStage::FetchDeviceInfo,
            DeviceError::Auth("rejected".into()),
        );
        assert_eq!(
            err.to_string(),
            "Step 0: Fetch Device Info failed: authentication failed: rejected"
        );
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(StageOutcome::Recovered("busy".into())).unwrap();
        assert_eq!(json, serde_json::json!({"status": "recovered", "detail": "busy"}));
        let json = serde_json::to_value(StageOutcome::AlreadySatisfied).unwrap();
        assert_eq!(json, serde_json::json!({"status": "already_satisfied"}));
    }
}
