//! Local HTTP front end.
//!
//! Exposes the device proxy, package/license uploads and background scan and
//! deployment jobs to browser clients on the same machine.

mod handlers;
pub mod jobs;
mod origin;

use axum::Router;
use axum::routing::{get, post};
use camdeploy_core::{AgentConfig, DeviceStack, Orchestrator, Scanner};
use jobs::{DeploySnapshot, JobRegistry, RETENTION_SECS, ScanSnapshot};
use origin::OriginPolicy;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

const EVICTION_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub stack: DeviceStack,
    pub scanner: Arc<Scanner>,
    pub orchestrator: Arc<Orchestrator>,
    pub scans: Arc<JobRegistry<ScanSnapshot>>,
    pub deploys: Arc<JobRegistry<DeploySnapshot>>,
    /// Plain client for fetching packages from release hosts.
    pub downloads: reqwest::Client,
}

impl AppState {
    pub fn new(config: AgentConfig, stack: DeviceStack) -> anyhow::Result<Self> {
        let retention = chrono::Duration::seconds(RETENTION_SECS);
        let downloads = reqwest::Client::builder()
            .user_agent(concat!("camdeploy-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.deploy.upload_timeout_secs))
            .build()?;

        Ok(Self {
            scanner: Arc::new(config.scanner(&stack)),
            orchestrator: Arc::new(config.orchestrator(&stack, None)),
            config: Arc::new(config),
            stack,
            scans: Arc::new(JobRegistry::new(retention)),
            deploys: Arc::new(JobRegistry::new(retention)),
            downloads,
        })
    }

    /// Periodically drop finished jobs past their retention window.
    pub fn spawn_eviction(&self) -> tokio::task::JoinHandle<()> {
        let scans = self.scans.clone();
        let deploys = self.deploys.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_INTERVAL);
            loop {
                interval.tick().await;
                let now = chrono::Utc::now();
                let evicted = scans.evict_finished(now) + deploys.evict_finished(now);
                if evicted > 0 {
                    tracing::debug!("Evicted {} finished jobs", evicted);
                }
            }
        })
    }
}

pub fn router(state: AppState) -> Router {
    let origins = Arc::new(OriginPolicy::new(
        state.config.service.allowed_origins.iter().cloned(),
    ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/proxy", post(handlers::proxy))
        .route("/upload-package", post(handlers::upload_package))
        .route("/upload-license", post(handlers::upload_license))
        .route("/scan", post(handlers::start_scan))
        .route(
            "/scan/:id",
            get(handlers::get_scan).delete(handlers::cancel_scan),
        )
        .route("/deploy", post(handlers::start_deploy))
        .route("/deploy/:id", get(handlers::get_deploy))
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(
            origins.clone(),
            origin::guard,
        ))
        .layer(origins.cors_layer())
        .layer(TraceLayer::new_for_http())
}
