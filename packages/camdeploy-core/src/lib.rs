//! camdeploy Core Library
//!
//! This crate provides the core functionality for camdeploy agents:
//! - Authenticated device HTTP client (no-auth → Basic → Digest, retries)
//! - Trust-on-first-use certificate pinning
//! - CIDR network scanning for camera devices
//! - Per-device provisioning orchestrator
//!
//! # Example
//!
//! ```no_run
//! use camdeploy_core::{DeviceCredentials, config};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load_config(None)?;
//!     let stack = config.device_stack()?;
//!
//!     let mut devices = config
//!         .scanner(&stack)
//!         .scan("192.168.1.0/24", DeviceCredentials::new("root", "secret"), None)?;
//!     while let Some(device) = devices.next().await {
//!         println!("{} {} at {}", device.vendor_brand, device.model, device.ip);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod deploy;
pub mod error;
pub mod http;
pub mod scanner;
pub mod tls;

// Re-export commonly used types
pub use auth::{DeviceCredentials, sanitize_credential};
pub use config::{AgentConfig, ConfigSource, DeviceStack};
pub use deploy::{
    DeployProgress, DeployStage, DeploymentJob, DeploymentReport, Orchestrator, StageOutcome,
    deploy_many,
};
pub use error::{DeviceError, ScanError, StageError, TransportError, TransportErrorKind};
pub use http::{DeviceClient, DeviceResponse, ProxyRequest, RequestBody, ResponseBody};
pub use scanner::{DiscoveredDevice, ScanProgress, ScanStream, ScanSummary, Scanner};
pub use tls::{CertificateStore, PinOutcome, PinPolicy};
