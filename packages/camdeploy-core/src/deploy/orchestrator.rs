use super::license::LicenseSigner;
use super::package::{PackageSource, match_artifacts, select_artifact};
use super::vapix::{self, ApplicationStatus, DeviceInfo, UploadKind, UploadVerdict};
use super::{
    DeployProgress, DeployProgressCallback, DeployStage, DeployTimings, DeploymentJob,
    DeploymentReport, PackageDescriptor, StageOutcome, StageRecord,
};
use crate::error::{DeviceError, StageError};
use crate::http::{DeviceClient, DeviceResponse, ProxyRequest};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct DeploySettings {
    /// Package name of the application on the device.
    pub app_name: String,
    pub scheme: String,
    pub upload_timeout: Duration,
    /// Status checks after a start command.
    pub start_checks: u32,
    /// Configuration submissions while the application reports a busy thread pool.
    pub config_attempts: u32,
    pub timings: DeployTimings,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            app_name: "BatonAnalytic".to_string(),
            scheme: "https".to_string(),
            upload_timeout: Duration::from_secs(300),
            start_checks: 3,
            config_attempts: 3,
            timings: DeployTimings::default(),
        }
    }
}

/// Runs deployment jobs. Holds no per-job state, so one instance serves any
/// number of concurrent jobs.
pub struct Orchestrator {
    client: DeviceClient,
    upload_client: DeviceClient,
    packages: Arc<dyn PackageSource>,
    signer: Arc<dyn LicenseSigner>,
    settings: DeploySettings,
}

impl Orchestrator {
    pub fn new(
        client: DeviceClient,
        packages: Arc<dyn PackageSource>,
        signer: Arc<dyn LicenseSigner>,
        settings: DeploySettings,
    ) -> Self {
        Self {
            upload_client: client.clone(),
            client,
            packages,
            signer,
            settings,
        }
    }

    /// Client used for package and license transfers.
    pub fn with_upload_client(mut self, client: DeviceClient) -> Self {
        self.upload_client = client;
        self
    }

    pub fn settings(&self) -> &DeploySettings {
        &self.settings
    }

    /// Execute every stage of `job`. Stops at the first fatal stage failure.
    pub async fn run(
        &self,
        job: &mut DeploymentJob,
        on_progress: Option<&DeployProgressCallback>,
    ) -> Result<DeploymentReport, StageError> {
        let started = Instant::now();
        let mut stages = Vec::with_capacity(DeployStage::ALL.len());
        let mut progress = Progress { job, on_progress };

        tracing::info!(
            "[{}] Starting deployment of {} as {}",
            progress.job.device.ip,
            self.settings.app_name,
            progress.job.device.credentials.display_user()
        );

        progress.enter(DeployStage::FetchDeviceInfo, "Reading device properties");
        let device = self.fetch_device_info(progress.job).await?;
        stages.push(StageRecord {
            stage: DeployStage::FetchDeviceInfo,
            outcome: StageOutcome::Completed,
        });

        progress.enter(DeployStage::DeployPackage, "Checking installed applications");
        let (outcome, artifact) = self.deploy_package(&mut progress, &device).await?;
        stages.push(StageRecord {
            stage: DeployStage::DeployPackage,
            outcome,
        });

        progress.enter(DeployStage::ActivateLicense, "Checking license state");
        let outcome = self.activate_license(&mut progress, &device).await?;
        stages.push(StageRecord {
            stage: DeployStage::ActivateLicense,
            outcome,
        });

        progress.enter(DeployStage::EnsureRunning, "Checking application status");
        let outcome = self.ensure_running(&mut progress).await?;
        stages.push(StageRecord {
            stage: DeployStage::EnsureRunning,
            outcome,
        });

        progress.enter(DeployStage::PushConfiguration, "Sending configuration");
        let outcome = self.push_configuration(&mut progress).await?;
        stages.push(StageRecord {
            stage: DeployStage::PushConfiguration,
            outcome,
        });

        progress.enter(DeployStage::Validate, "Validating deployment");
        let outcome = self.validate(progress.job).await?;
        stages.push(StageRecord {
            stage: DeployStage::Validate,
            outcome,
        });
        progress.update(DeployStage::Validate, 1.0, "Deployment complete");

        let report = DeploymentReport {
            ip: progress.job.device.ip.clone(),
            device,
            artifact,
            stages,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            "[{}] Deployment complete in {:.1}s",
            report.ip,
            report.elapsed_secs
        );
        Ok(report)
    }

    async fn call(
        &self,
        stage: DeployStage,
        request: &ProxyRequest,
    ) -> Result<DeviceResponse, StageError> {
        self.client
            .execute(request)
            .await
            .map_err(|e| StageError::device(stage, e))
    }

    async fn application(
        &self,
        stage: DeployStage,
        job: &DeploymentJob,
    ) -> Result<Option<ApplicationStatus>, StageError> {
        let request = vapix::list_applications_request(
            &self.settings.scheme,
            &job.device.ip,
            &job.device.credentials,
        );
        let response = self.call(stage, &request).await?;
        if !response.is_success() {
            return Err(StageError::device(
                stage,
                DeviceError::Protocol(format!(
                    "application list failed: {}",
                    response.error_message()
                )),
            ));
        }
        Ok(vapix::parse_applications(&response.text())
            .into_iter()
            .find(|app| app.name.eq_ignore_ascii_case(&self.settings.app_name)))
    }

    async fn fetch_device_info(&self, job: &DeploymentJob) -> Result<DeviceInfo, StageError> {
        let stage = DeployStage::FetchDeviceInfo;
        let request =
            vapix::device_info_request(&self.settings.scheme, &job.device.ip, &job.device.credentials);
        let response = self.call(stage, &request).await?;
        if !response.is_success() {
            return Err(StageError::device(
                stage,
                DeviceError::Protocol(response.error_message()),
            ));
        }

        let info = vapix::parse_device_info(&response)
            .map_err(|detail| StageError::verification(stage, detail))?;
        tracing::info!(
            "[{}] {} firmware {} ({}, {})",
            job.device.ip,
            info.model.as_deref().unwrap_or("device"),
            info.firmware_version,
            info.architecture,
            info.os_family
        );
        Ok(info)
    }

    async fn deploy_package(
        &self,
        progress: &mut Progress<'_>,
        device: &DeviceInfo,
    ) -> Result<(StageOutcome, Option<String>), StageError> {
        let stage = DeployStage::DeployPackage;
        if let Some(app) = self.application(stage, progress.job).await? {
            tracing::info!(
                "[{}] {} {} already installed",
                progress.job.device.ip,
                app.name,
                app.version.as_deref().unwrap_or("")
            );
            return Ok((StageOutcome::AlreadySatisfied, None));
        }

        let package = progress.job.package.clone();
        let (name, data) = match &package {
            PackageDescriptor::Inline { name, data } => (name.clone(), data.as_ref().clone()),
            PackageDescriptor::Artifact(artifact) => {
                progress.update(stage, 0.1, &format!("Downloading {}", artifact.name));
                let data = self
                    .packages
                    .download(artifact)
                    .await
                    .map_err(|e| StageError::external(stage, format!("{:#}", e)))?;
                (artifact.name.clone(), data)
            }
            PackageDescriptor::Latest => {
                progress.update(stage, 0.05, "Resolving package");
                let artifacts = self
                    .packages
                    .list_artifacts()
                    .await
                    .map_err(|e| StageError::external(stage, format!("{:#}", e)))?;
                let candidates =
                    match_artifacts(&artifacts, &device.architecture, device.os_family.token());
                let artifact = select_artifact(&candidates).ok_or_else(|| {
                    StageError::external(
                        stage,
                        format!(
                            "no package for {}/{} among {} artifacts",
                            device.architecture,
                            device.os_family,
                            artifacts.len()
                        ),
                    )
                })?;
                progress.update(stage, 0.1, &format!("Downloading {}", artifact.name));
                let data = self
                    .packages
                    .download(artifact)
                    .await
                    .map_err(|e| StageError::external(stage, format!("{:#}", e)))?;
                (artifact.name.clone(), data)
            }
        };

        progress.update(stage, 0.4, &format!("Uploading {} ({} bytes)", name, data.len()));
        let job = &*progress.job;
        let request = vapix::upload_package_request(
            &self.settings.scheme,
            &job.device.ip,
            &job.device.credentials,
            &name,
            data,
        )
        .with_timeout(self.settings.upload_timeout);
        let response = self
            .upload_client
            .execute(&request)
            .await
            .map_err(|e| StageError::device(stage, e))?;

        match vapix::interpret_upload(UploadKind::Package, &response) {
            UploadVerdict::Rejected(reason) => {
                return Err(StageError::verification(
                    stage,
                    format!("device rejected {}: {}", name, reason),
                ));
            }
            UploadVerdict::AlreadySatisfied => {
                tracing::info!("[{}] Device reports {} already installed", job.device.ip, name);
            }
            UploadVerdict::Accepted => {
                tracing::info!("[{}] Uploaded {}", job.device.ip, name);
            }
        }

        progress.update(stage, 0.9, "Confirming installation");
        if self.application(stage, progress.job).await?.is_none() {
            return Err(StageError::verification(
                stage,
                format!(
                    "{} uploaded but {} is not listed",
                    name, self.settings.app_name
                ),
            ));
        }
        Ok((StageOutcome::Completed, Some(name)))
    }

    async fn activate_license(
        &self,
        progress: &mut Progress<'_>,
        device: &DeviceInfo,
    ) -> Result<StageOutcome, StageError> {
        let stage = DeployStage::ActivateLicense;
        let app = self.application(stage, progress.job).await?.ok_or_else(|| {
            StageError::verification(stage, format!("{} is not installed", self.settings.app_name))
        })?;
        if app.is_licensed() {
            tracing::info!("[{}] {} already licensed", progress.job.device.ip, app.name);
            return Ok(StageOutcome::AlreadySatisfied);
        }

        let license_xml = match progress.job.license_xml.clone() {
            Some(xml) => xml,
            None => {
                progress.update(stage, 0.1, "Requesting signed license");
                self.signer
                    .sign(
                        &device.serial_number,
                        &progress.job.license_key,
                        &self.settings.app_name,
                    )
                    .await
                    .map_err(|e| StageError::external(stage, format!("{:#}", e)))?
            }
        };

        progress.update(stage, 0.3, "Uploading license");
        let job = &*progress.job;
        let request = vapix::upload_license_request(
            &self.settings.scheme,
            &job.device.ip,
            &job.device.credentials,
            &self.settings.app_name,
            &license_xml,
        )
        .with_timeout(self.settings.upload_timeout);
        let response = self
            .upload_client
            .execute(&request)
            .await
            .map_err(|e| StageError::device(stage, e))?;

        let verdict = vapix::interpret_upload(UploadKind::License, &response);
        match &verdict {
            UploadVerdict::Rejected(reason) => {
                return Err(StageError::verification(
                    stage,
                    format!("license upload rejected: {}", reason),
                ));
            }
            UploadVerdict::AlreadySatisfied => {
                tracing::info!("[{}] Device reports license already active", job.device.ip);
            }
            UploadVerdict::Accepted => {
                tracing::info!("[{}] License uploaded", job.device.ip);
            }
        }

        progress.update(stage, 0.6, "Waiting for license activation");
        sleep(self.settings.timings.license_settle).await;

        // Devices can accept an upload without activating it.
        let app = self.application(stage, progress.job).await?;
        match app {
            Some(app) if app.is_licensed() => Ok(match verdict {
                UploadVerdict::AlreadySatisfied => StageOutcome::AlreadySatisfied,
                _ => StageOutcome::Completed,
            }),
            Some(app) => Err(StageError::verification(
                stage,
                format!(
                    "license uploaded but {} reports License={}",
                    app.name,
                    app.license.as_deref().unwrap_or("unknown")
                ),
            )),
            None => Err(StageError::verification(
                stage,
                format!("{} disappeared after license upload", self.settings.app_name),
            )),
        }
    }

    async fn ensure_running(&self, progress: &mut Progress<'_>) -> Result<StageOutcome, StageError> {
        let stage = DeployStage::EnsureRunning;
        let app = self.application(stage, progress.job).await?.ok_or_else(|| {
            StageError::verification(stage, format!("{} is not installed", self.settings.app_name))
        })?;
        if app.is_running() {
            return Ok(StageOutcome::AlreadySatisfied);
        }

        progress.update(stage, 0.2, "Starting application");
        let job = &*progress.job;
        let request = vapix::start_request(
            &self.settings.scheme,
            &job.device.ip,
            &job.device.credentials,
            &self.settings.app_name,
        );
        let reply = self.call(stage, &request).await?;
        let reply_text = if reply.is_success() {
            reply.text().trim().to_string()
        } else {
            reply.error_message()
        };
        tracing::debug!("[{}] start reply: {}", job.device.ip, reply_text);

        let checks = self.settings.start_checks.max(1);
        let mut last_status = app.status.clone();
        for check in 1..=checks {
            sleep(self.settings.timings.start_poll).await;
            progress.update(
                stage,
                0.2 + 0.8 * check as f32 / checks as f32,
                &format!("Waiting for application to start ({}/{})", check, checks),
            );
            match self.application(stage, progress.job).await? {
                Some(app) if app.is_running() => return Ok(StageOutcome::Completed),
                Some(app) => last_status = app.status,
                None => last_status = None,
            }
        }

        Err(StageError::verification(
            stage,
            format!(
                "{} not running after {} checks (status: {}, start reply: {})",
                self.settings.app_name,
                checks,
                last_status.as_deref().unwrap_or("unknown"),
                reply_text
            ),
        ))
    }

    async fn push_configuration(
        &self,
        progress: &mut Progress<'_>,
    ) -> Result<StageOutcome, StageError> {
        let stage = DeployStage::PushConfiguration;
        if progress.job.config.is_null() {
            return Ok(StageOutcome::Skipped("no configuration supplied".to_string()));
        }

        let attempts = self.settings.config_attempts.max(1);
        for attempt in 1..=attempts {
            let job = &*progress.job;
            let request = vapix::config_request(
                &self.settings.scheme,
                &job.device.ip,
                &job.device.credentials,
                &self.settings.app_name,
                &job.config,
            );
            let response = self.call(stage, &request).await?;

            if vapix::is_thread_pool_error(&response) {
                if attempt == attempts {
                    tracing::warn!(
                        "[{}] Application still restarting after {} attempts; continuing",
                        job.device.ip,
                        attempts
                    );
                    return Ok(StageOutcome::Recovered(format!(
                        "application busy restarting: {}",
                        response.error_message()
                    )));
                }
                tracing::info!(
                    "[{}] Application restarting (attempt {}/{}), retrying configuration",
                    job.device.ip,
                    attempt,
                    attempts
                );
                progress.update(stage, attempt as f32 / attempts as f32, "Application restarting");
                sleep(self.settings.timings.config_retry).await;
                continue;
            }

            if !response.is_success() || reports_error(&response) {
                return Err(StageError::device(
                    stage,
                    DeviceError::Protocol(format!(
                        "configuration rejected: {}",
                        response.error_message()
                    )),
                ));
            }
            return Ok(StageOutcome::Completed);
        }

        Ok(StageOutcome::Completed)
    }

    async fn validate(&self, job: &DeploymentJob) -> Result<StageOutcome, StageError> {
        let stage = DeployStage::Validate;
        let app = self.application(stage, job).await?.ok_or_else(|| {
            StageError::verification(stage, format!("{} is not installed", self.settings.app_name))
        })?;
        if !app.is_running() {
            return Err(StageError::verification(
                stage,
                format!(
                    "{} is not running (status: {})",
                    app.name,
                    app.status.as_deref().unwrap_or("unknown")
                ),
            ));
        }
        if !app.is_licensed() {
            return Err(StageError::verification(
                stage,
                format!(
                    "{} is not licensed (license: {})",
                    app.name,
                    app.license.as_deref().unwrap_or("unknown")
                ),
            ));
        }
        Ok(StageOutcome::Completed)
    }
}

/// JSON replies that carry an `error` member despite a 2xx status.
fn reports_error(response: &DeviceResponse) -> bool {
    response
        .json()
        .and_then(|v| v.get("error"))
        .is_some_and(|e| !e.is_null() && e != &Value::Bool(false))
}

/// Tracks the job's stage and percentage and forwards updates to the caller.
struct Progress<'a> {
    job: &'a mut DeploymentJob,
    on_progress: Option<&'a DeployProgressCallback>,
}

impl Progress<'_> {
    fn enter(&mut self, stage: DeployStage, message: &str) {
        tracing::info!("[{}] {}", self.job.device.ip, stage.label());
        self.update(stage, 0.0, message);
    }

    fn update(&mut self, stage: DeployStage, fraction: f32, message: &str) {
        self.job.current_stage = Some(stage);
        self.job.progress_percent = stage.percent_at(fraction);
        if let Some(callback) = self.on_progress {
            callback(DeployProgress {
                ip: self.job.device.ip.clone(),
                stage,
                stage_label: stage.label(),
                percent: self.job.progress_percent,
                message: message.to_string(),
            });
        }
    }
}
