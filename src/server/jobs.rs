//! Background scan and deployment jobs.
//!
//! Each job publishes its latest snapshot on a watch channel; HTTP handlers
//! read the current value. Finished jobs stay readable for a retention
//! window and are then evicted.

use camdeploy_core::deploy::{DeployProgress, DeployProgressCallback};
use camdeploy_core::scanner::{ProgressCallback, ScanProgress};
use camdeploy_core::{
    DeployStage, DeploymentJob, DeploymentReport, DiscoveredDevice, Orchestrator, ScanStream,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Seconds a finished job's snapshot stays readable.
pub const RETENTION_SECS: i64 = 60;

pub trait Snapshot: Clone + Send + Sync + 'static {
    fn completed_at(&self) -> Option<DateTime<Utc>>;
}

struct Entry<T> {
    snapshot: watch::Receiver<T>,
    cancel: CancellationToken,
}

/// Handle given to the task that runs a job.
pub struct JobHandle<T> {
    pub id: Uuid,
    pub updates: watch::Sender<T>,
    pub cancel: CancellationToken,
}

pub struct JobRegistry<T> {
    entries: Mutex<HashMap<Uuid, Entry<T>>>,
    retention: chrono::Duration,
}

impl<T: Snapshot> JobRegistry<T> {
    pub fn new(retention: chrono::Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Register a job; `initial` is built from the new id.
    pub fn insert(&self, initial: impl FnOnce(Uuid) -> T) -> JobHandle<T> {
        let id = Uuid::new_v4();
        let (updates, snapshot) = watch::channel(initial(id));
        let cancel = CancellationToken::new();
        self.lock().insert(
            id,
            Entry {
                snapshot,
                cancel: cancel.clone(),
            },
        );
        JobHandle {
            id,
            updates,
            cancel,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<T> {
        self.lock().get(id).map(|e| e.snapshot.borrow().clone())
    }

    pub fn remove(&self, id: &Uuid) {
        self.lock().remove(id);
    }

    /// Request cancellation; `false` if the job is unknown.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.lock().get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop jobs that finished more than the retention window before `now`.
    pub fn evict_finished(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| match entry.snapshot.borrow().completed_at() {
            Some(done) => now - done < self.retention,
            None => true,
        });
        before - entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Entry<T>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSnapshot {
    pub scan_id: Uuid,
    pub cidr: String,
    pub status: ScanStatus,
    pub total_ips: usize,
    pub scanned: usize,
    pub percent: u8,
    pub devices: Vec<DiscoveredDevice>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanSnapshot {
    pub fn new(scan_id: Uuid, cidr: &str, total_ips: usize) -> Self {
        Self {
            scan_id,
            cidr: cidr.to_string(),
            status: ScanStatus::Running,
            total_ips,
            scanned: 0,
            percent: 0,
            devices: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

impl Snapshot for ScanSnapshot {
    fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

/// Progress callback that mirrors scan progress into the snapshot.
pub fn scan_progress(updates: &watch::Sender<ScanSnapshot>) -> ProgressCallback {
    let updates = updates.clone();
    Box::new(move |p: ScanProgress| {
        updates.send_modify(|s| {
            s.scanned = p.scanned;
            s.percent = p.percent;
        });
    })
}

/// Drive a scan to completion or cancellation, publishing devices as they
/// are found.
pub async fn run_scan(mut stream: ScanStream, job: JobHandle<ScanSnapshot>) {
    let mut cancelled = false;
    loop {
        tokio::select! {
            _ = job.cancel.cancelled() => {
                cancelled = true;
                break;
            }
            next = stream.next() => match next {
                Some(device) => job.updates.send_modify(|s| s.devices.push(device)),
                None => break,
            },
        }
    }

    let summary = if cancelled {
        tracing::info!("Scan {} cancelled", job.id);
        stream.cancel().await
    } else {
        stream.finish().await
    };

    job.updates.send_modify(|s| {
        s.status = if cancelled {
            ScanStatus::Cancelled
        } else {
            ScanStatus::Completed
        };
        s.scanned = summary.scanned;
        s.percent = if cancelled { s.percent } else { 100 };
        s.completed_at = Some(Utc::now());
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploySnapshot {
    pub job_id: Uuid,
    pub ip: String,
    pub status: DeployStatus,
    pub stage: Option<DeployStage>,
    pub stage_label: Option<String>,
    pub percent: u8,
    pub message: String,
    pub report: Option<DeploymentReport>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeploySnapshot {
    pub fn new(job_id: Uuid, ip: &str) -> Self {
        Self {
            job_id,
            ip: ip.to_string(),
            status: DeployStatus::Running,
            stage: None,
            stage_label: None,
            percent: 0,
            message: "Queued".to_string(),
            report: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

impl Snapshot for DeploySnapshot {
    fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

pub async fn run_deploy(
    orchestrator: Arc<Orchestrator>,
    mut deployment: DeploymentJob,
    job: JobHandle<DeploySnapshot>,
) {
    let updates = job.updates.clone();
    let on_progress: DeployProgressCallback = Arc::new(move |p: DeployProgress| {
        updates.send_modify(|s| {
            s.stage = Some(p.stage);
            s.stage_label = Some(p.stage_label);
            s.percent = p.percent;
            s.message = p.message;
        });
    });

    let result = orchestrator.run(&mut deployment, Some(&on_progress)).await;

    job.updates.send_modify(|s| {
        match result {
            Ok(report) => {
                s.status = DeployStatus::Succeeded;
                s.percent = 100;
                s.message = "Deployment complete".to_string();
                s.report = Some(report);
            }
            Err(e) => {
                tracing::warn!("Deployment {} to {} failed: {}", job.id, s.ip, e);
                s.status = DeployStatus::Failed;
                s.stage = Some(e.stage);
                s.stage_label = Some(e.stage.label());
                s.error = Some(e.to_string());
            }
        }
        s.completed_at = Some(Utc::now());
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JobRegistry<ScanSnapshot> {
        JobRegistry::new(chrono::Duration::seconds(RETENTION_SECS))
    }

    #[test]
    fn test_snapshot_reflects_updates() {
        let jobs = registry();
        let job = jobs.insert(|id| ScanSnapshot::new(id, "10.0.0.0/30", 4));
        job.updates.send_modify(|s| s.scanned = 2);

        let snapshot = jobs.get(&job.id).unwrap();
        assert_eq!(snapshot.scan_id, job.id);
        assert_eq!(snapshot.scanned, 2);
        assert_eq!(snapshot.status, ScanStatus::Running);
    }

    #[test]
    fn test_finished_jobs_evicted_after_retention() {
        let jobs = registry();
        let running = jobs.insert(|id| ScanSnapshot::new(id, "10.0.0.0/30", 4));
        let finished = jobs.insert(|id| ScanSnapshot::new(id, "10.0.1.0/30", 4));
        let done = Utc::now();
        finished.updates.send_modify(|s| s.completed_at = Some(done));

        assert_eq!(jobs.evict_finished(done + chrono::Duration::seconds(30)), 0);
        assert_eq!(jobs.evict_finished(done + chrono::Duration::seconds(61)), 1);
        assert!(jobs.get(&finished.id).is_none());
        assert!(jobs.get(&running.id).is_some());
    }

    #[test]
    fn test_cancel_unknown_job() {
        let jobs = registry();
        assert!(!jobs.cancel(&Uuid::new_v4()));

        let job = jobs.insert(|id| ScanSnapshot::new(id, "10.0.0.0/30", 4));
        assert!(jobs.cancel(&job.id));
        assert!(job.cancel.is_cancelled());
    }
}
