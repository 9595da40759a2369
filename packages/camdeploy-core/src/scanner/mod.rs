//! Network scanning module.
//!
//! Expands a CIDR block and probes every address through the authenticated
//! client in fixed-size batches. Only positively identified devices are
//! reported; timeouts, refusals and foreign payloads are silent misses.

pub mod cidr;
mod identify;

pub use identify::{DeviceKind, DiscoveredDevice, PROBE_PATH, identify, probe, probe_body};

use crate::auth::DeviceCredentials;
use crate::error::ScanError;
use crate::http::{DeviceClient, RetryPolicy};
use futures::Stream;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub batch_size: usize,
    pub probe_timeout: Duration,
    pub max_hosts: usize,
    /// `https` or `http`.
    pub scheme: String,
    /// Drop speakers, intercoms and access-control units.
    pub cameras_only: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            max_hosts: cidr::DEFAULT_MAX_HOSTS,
            scheme: "https".to_string(),
            cameras_only: false,
        }
    }
}

/// Progress updates during network scanning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub stage: ScanStage,
    pub scanned: usize,
    pub total: usize,
    pub devices_found: usize,
    pub percent: u8,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    Probing,
    Complete,
    Abandoned,
}

/// Callback type for scan progress updates
pub type ProgressCallback = Box<dyn Fn(ScanProgress) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub scanned: usize,
    pub total: usize,
    pub found: usize,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[derive(Clone)]
pub struct Scanner {
    client: DeviceClient,
    options: ScanOptions,
}

impl Scanner {
    /// Probes are single-shot regardless of the client's retry policy.
    pub fn new(client: DeviceClient, options: ScanOptions) -> Self {
        Self {
            client: client.with_retry(RetryPolicy::none()),
            options,
        }
    }

    /// Start scanning `cidr`. Devices arrive on the returned stream as each
    /// batch completes; `on_progress` fires after every batch.
    ///
    /// Must be called inside a tokio runtime.
    pub fn scan(
        &self,
        cidr: &str,
        credentials: DeviceCredentials,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ScanStream, ScanError> {
        let addresses = cidr::expand(cidr, self.options.max_hosts)?;
        let total = addresses.len();
        let batch_size = self.options.batch_size.max(1);
        let (tx, rx) = mpsc::channel(batch_size);

        tracing::info!(
            "Scanning {} ({} addresses, batches of {}) as {}",
            cidr,
            total,
            batch_size,
            credentials.display_user()
        );

        let client = self.client.clone();
        let options = self.options.clone();
        let cidr = cidr.to_string();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut scanned = 0;
            let mut found = 0;

            let emit = |stage: ScanStage, scanned: usize, found: usize| {
                if let Some(callback) = &on_progress {
                    callback(ScanProgress {
                        stage,
                        scanned,
                        total,
                        devices_found: found,
                        percent: percent(scanned, total),
                        elapsed_secs: started.elapsed().as_secs_f64(),
                    });
                }
            };

            for batch in addresses.chunks(batch_size) {
                if tx.is_closed() {
                    tracing::info!("Scan of {} abandoned after {} addresses", cidr, scanned);
                    emit(ScanStage::Abandoned, scanned, found);
                    break;
                }

                let probes = batch.iter().map(|ip| {
                    let client = client.clone();
                    let credentials = credentials.clone();
                    let scheme = options.scheme.clone();
                    let ip = *ip;
                    let timeout = options.probe_timeout;
                    tokio::spawn(async move {
                        probe(&client, &scheme, ip, &credentials, timeout).await
                    })
                });

                for device in join_all(probes).await.into_iter().flatten().flatten() {
                    if options.cameras_only && device.device_kind != DeviceKind::Camera {
                        tracing::debug!("Skipping non-camera {} ({})", device.ip, device.model);
                        continue;
                    }
                    tracing::info!(
                        "Found {} {} at {} (serial {})",
                        device.vendor_brand,
                        device.model,
                        device.ip,
                        device.serial_number
                    );
                    found += 1;
                    // A closed receiver is noticed before the next batch.
                    let _ = tx.send(device).await;
                }

                scanned += batch.len();
                tracing::debug!(
                    "Scan progress: {}/{} addresses probed, {} devices",
                    scanned,
                    total,
                    found
                );
                emit(ScanStage::Probing, scanned, found);
            }

            let summary = ScanSummary {
                scanned,
                total,
                found,
                elapsed: started.elapsed(),
            };
            if scanned == total {
                tracing::info!(
                    "Scan of {} complete: {} devices in {:.1}s",
                    cidr,
                    found,
                    summary.elapsed.as_secs_f64()
                );
                emit(ScanStage::Complete, scanned, found);
            }
            summary
        });

        Ok(ScanStream {
            rx,
            handle,
            total,
        })
    }
}

fn percent(scanned: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((scanned * 100) / total).min(100) as u8
}

/// Lazy sequence of discovered devices. Finite and not restartable; dropping
/// it stops the scan at the next batch boundary.
pub struct ScanStream {
    rx: mpsc::Receiver<DiscoveredDevice>,
    handle: JoinHandle<ScanSummary>,
    total: usize,
}

impl ScanStream {
    /// Number of addresses the scan will probe.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Wait for the scan to end, discarding devices not yet consumed.
    pub async fn finish(mut self) -> ScanSummary {
        while self.rx.recv().await.is_some() {}
        self.join().await
    }

    /// Stop probing at the next batch boundary and return the partial summary.
    pub async fn cancel(mut self) -> ScanSummary {
        self.rx.close();
        while self.rx.recv().await.is_some() {}
        self.join().await
    }

    /// Drain every device and wait for the summary.
    pub async fn collect_all(mut self) -> (Vec<DiscoveredDevice>, ScanSummary) {
        let mut devices = Vec::new();
        while let Some(device) = self.rx.recv().await {
            devices.push(device);
        }
        let summary = self.join().await;
        (devices, summary)
    }

    async fn join(self) -> ScanSummary {
        let total = self.total;
        self.handle.await.unwrap_or_else(|e| {
            tracing::error!("Scan task failed: {}", e);
            ScanSummary {
                total,
                ..ScanSummary::default()
            }
        })
    }
}

impl Stream for ScanStream {
    type Item = DiscoveredDevice;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TransportError, TransportErrorKind};
    use crate::http::{Transport, WireRequest, WireResponse};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers as an open device at the configured addresses.
    struct Subnet {
        devices: Vec<(&'static str, &'static str)>,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Subnet {
        async fn send(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            for (ip, product) in &self.devices {
                if request.url.contains(&format!("//{}/", ip)) {
                    let body = json!({"data": {"propertyList": {
                        "Brand": "AXIS", "ProdNbr": product, "SerialNumber": format!("SN-{}", ip)
                    }}});
                    return Ok(WireResponse::new(200, body.to_string()));
                }
            }
            Err(TransportError::new(TransportErrorKind::Timeout, "no host"))
        }
    }

    fn scanner(devices: Vec<(&'static str, &'static str)>, options: ScanOptions) -> (Scanner, Arc<Subnet>) {
        let subnet = Arc::new(Subnet {
            devices,
            probes: AtomicUsize::new(0),
        });
        let client = DeviceClient::new(subnet.clone());
        (Scanner::new(client, options), subnet)
    }

    fn creds() -> DeviceCredentials {
        DeviceCredentials::new("root", "pass")
    }

    #[tokio::test]
    async fn test_scan_reports_only_identified_devices() {
        let (scanner, subnet) = scanner(
            vec![("10.9.0.7", "P3265"), ("10.9.0.200", "C1310")],
            ScanOptions::default(),
        );
        let (devices, summary) = scanner
            .scan("10.9.0.0/24", creds(), None)
            .unwrap()
            .collect_all()
            .await;

        assert_eq!(devices.len(), 2);
        assert_eq!(summary.scanned, 256);
        assert_eq!(summary.found, 2);
        // Probes are single-shot: one wire request per address.
        assert_eq!(subnet.probes.load(Ordering::SeqCst), 256);
    }

    #[tokio::test]
    async fn test_progress_after_every_batch() {
        let (scanner, _) = scanner(vec![("10.9.0.7", "P3265")], ScanOptions::default());
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let summary = scanner
            .scan(
                "10.9.0.0/24",
                creds(),
                Some(Box::new(move |p: ScanProgress| sink.lock().unwrap().push(p))),
            )
            .unwrap()
            .finish()
            .await;

        let updates = updates.lock().unwrap();
        let probing: Vec<_> = updates.iter().filter(|p| p.stage == ScanStage::Probing).collect();
        // 256 addresses in batches of 50.
        assert_eq!(probing.len(), 6);
        assert_eq!(probing[0].scanned, 50);
        assert_eq!(probing.last().unwrap().scanned, 256);
        assert_eq!(updates.last().unwrap().stage, ScanStage::Complete);
        assert_eq!(updates.last().unwrap().percent, 100);
        assert_eq!(summary.found, 1);
    }

    #[tokio::test]
    async fn test_empty_subnet_is_valid() {
        let (scanner, _) = scanner(vec![], ScanOptions::default());
        let mut stream = scanner.scan("10.9.0.0/28", creds(), None).unwrap();
        assert_eq!(stream.total(), 16);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cameras_only_filters_speakers() {
        let options = ScanOptions {
            cameras_only: true,
            ..ScanOptions::default()
        };
        let (scanner, _) = scanner(vec![("10.9.0.1", "M3086"), ("10.9.0.2", "C1310")], options);
        let (devices, _) = scanner.scan("10.9.0.0/29", creds(), None).unwrap().collect_all().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_kind, DeviceKind::Camera);
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_scan() {
        let options = ScanOptions {
            batch_size: 1,
            ..ScanOptions::default()
        };
        let (scanner, subnet) = scanner(vec![("10.9.0.0", "P1")], options);
        let mut stream = scanner.scan("10.9.0.0/24", creds(), None).unwrap();
        assert!(stream.next().await.is_some());
        drop(stream);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(subnet.probes.load(Ordering::SeqCst) < 256);
    }

    #[tokio::test]
    async fn test_cancel_returns_partial_summary() {
        let options = ScanOptions {
            batch_size: 1,
            ..ScanOptions::default()
        };
        let (scanner, _) = scanner(vec![("10.9.0.0", "P1")], options);
        let mut stream = scanner.scan("10.9.0.0/24", creds(), None).unwrap();
        assert!(stream.next().await.is_some());

        let summary = stream.cancel().await;
        assert_eq!(summary.total, 256);
        assert!(summary.scanned < 256);
        assert_eq!(summary.found, 1);
    }

    #[test]
    fn test_invalid_cidr_fails_up_front() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let (scanner, _) = scanner(vec![], ScanOptions::default());
        assert!(matches!(
            scanner.scan("300.1.1.0/24", creds(), None),
            Err(ScanError::InvalidCidr(_))
        ));
    }
}
