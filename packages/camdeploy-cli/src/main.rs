//! camdeploy CLI - Discover and provision network cameras from a terminal
//!
//! This binary drives the same core library as the local service:
//! - Scan a CIDR block for cameras
//! - Send authenticated requests to a device, or identify it
//! - Deploy the analytics package, license and configuration to devices
//! - Inspect and reset pinned device certificates

use anyhow::{Context, Result, bail};
use camdeploy_core::deploy::{DeployProgress, DeployProgressCallback, PackageDescriptor};
use camdeploy_core::{
    AgentConfig, DeploymentJob, DeviceCredentials, ProxyRequest, RequestBody, StageOutcome,
    config, deploy_many, scanner,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "camdeploy")]
#[command(author = "camdeploy Team")]
#[command(version)]
#[command(about = "Discover and provision network cameras")]
#[command(long_about = "
camdeploy finds cameras on a local network and installs the analytics
application on them: package, license, start and configuration.

Quick start:
  1. Find cameras:   camdeploy scan 192.168.1.0/24 --password <pw>
  2. Deploy:         camdeploy deploy 192.168.1.20 --password <pw> --license-key <key>

The device password may also be supplied through CAMDEPLOY_PASSWORD.
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Args)]
pub struct DeviceArgs {
    /// Device user name
    #[arg(short, long, default_value = "root")]
    pub user: String,

    /// Device password
    #[arg(short, long, env = "CAMDEPLOY_PASSWORD", hide_env_values = true)]
    pub password: String,
}

impl DeviceArgs {
    fn credentials(&self) -> DeviceCredentials {
        DeviceCredentials::new(&self.user, &self.password)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan a CIDR block for devices
    ///
    /// Every device that answers the identification call with a brand and a
    /// serial number is reported, whatever its product family. Use
    /// --cameras-only (or `cameras_only = true` under [scan]) to keep cameras only.
    Scan {
        /// Network to scan, e.g. 192.168.1.0/24
        cidr: String,

        /// Report cameras only; speakers, intercoms and door controllers are skipped
        #[arg(long)]
        cameras_only: bool,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Send one authenticated request to a device and print the reply
    Probe {
        /// Full device URL, e.g. https://192.168.1.20/axis-cgi/param.cgi?action=list
        url: String,

        #[command(flatten)]
        device: DeviceArgs,

        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
    },

    /// Identify the device at an address
    Identify {
        ip: Ipv4Addr,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Install, license, start and configure the application on devices
    Deploy {
        /// Device addresses
        #[arg(required = true)]
        ips: Vec<String>,

        #[command(flatten)]
        device: DeviceArgs,

        /// License key to activate
        #[arg(short, long, env = "CAMDEPLOY_LICENSE_KEY", hide_env_values = true)]
        license_key: String,

        /// JSON installer configuration pushed to the application
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Package file to install instead of the latest release
        #[arg(long)]
        package: Option<PathBuf>,

        /// Pre-signed license XML (skips the signing service)
        #[arg(long)]
        license_xml: Option<PathBuf>,
    },

    /// Inspect pinned device certificates
    Pins {
        #[command(subcommand)]
        action: PinsAction,
    },

    /// Show configuration paths and settings
    Config,
}

#[derive(Subcommand)]
pub enum PinsAction {
    /// List pinned certificates
    List,
    /// Forget the pin for a host so its next certificate is trusted
    Forget { host: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "camdeploy={},camdeploy_core={},security=warn",
                    log_level, log_level
                )
                .into()
            }),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = config::load_config(None)?;

    match &cli.command {
        Commands::Scan {
            cidr,
            cameras_only,
            device,
        } => {
            let mut config = config.clone();
            config.scan.cameras_only |= *cameras_only;
            cmd_scan(&cli, &config, cidr, device).await
        }
        Commands::Probe {
            url,
            device,
            method,
            body,
        } => cmd_probe(&cli, &config, url, device, method, body.as_deref()).await,
        Commands::Identify { ip, device } => cmd_identify(&cli, &config, *ip, device).await,
        Commands::Deploy {
            ips,
            device,
            license_key,
            config: installer_config,
            package,
            license_xml,
        } => {
            let options = DeployOptions {
                license_key,
                installer_config: installer_config.as_deref(),
                package: package.as_deref(),
                license_xml: license_xml.as_deref(),
            };
            cmd_deploy(&cli, &config, ips, device, options).await
        }
        Commands::Pins { action } => cmd_pins(&cli, &config, action),
        Commands::Config => cmd_config(&cli, &config),
    }
}

async fn cmd_scan(cli: &Cli, config: &AgentConfig, cidr: &str, device: &DeviceArgs) -> Result<()> {
    let stack = config.device_stack()?;
    let scanner = config.scanner(&stack);

    let progress_callback: Option<scanner::ProgressCallback> = match cli.format {
        OutputFormat::Text => Some(Box::new(|progress: scanner::ScanProgress| {
            eprintln!(
                "  [{:>3}%] {}/{} addresses, {} found",
                progress.percent, progress.scanned, progress.total, progress.devices_found
            );
        })),
        OutputFormat::Json => None,
    };

    let mut stream = scanner.scan(cidr, device.credentials(), progress_callback)?;
    if let OutputFormat::Text = cli.format {
        println!("Scanning {} ({} addresses)...", cidr, stream.total());
    }

    let mut devices = Vec::new();
    let mut interrupted = false;
    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(found) => {
                    if let OutputFormat::Text = cli.format {
                        println!(
                            "  {:15} {:8} {:30} {}",
                            found.ip, found.vendor_brand, found.model, found.serial_number
                        );
                    }
                    devices.push(found);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, abandoning scan");
                interrupted = true;
                break;
            }
        }
    }
    let summary = if interrupted {
        stream.cancel().await
    } else {
        stream.finish().await
    };

    match cli.format {
        OutputFormat::Text => {
            println!();
            println!(
                "Found {} device(s) in {} of {} addresses ({:.1}s)",
                summary.found,
                summary.scanned,
                summary.total,
                summary.elapsed.as_secs_f64()
            );
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "cidr": cidr,
                    "devices": devices,
                    "summary": summary,
                })
            );
        }
    }

    Ok(())
}

async fn cmd_probe(
    cli: &Cli,
    config: &AgentConfig,
    url: &str,
    device: &DeviceArgs,
    method: &str,
    body: Option<&str>,
) -> Result<()> {
    let mut request = ProxyRequest::new(method, url, device.credentials());
    if let Some(body) = body {
        let body: serde_json::Value =
            serde_json::from_str(body).context("--body must be valid JSON")?;
        request = request.with_body(RequestBody::Json(body));
    }

    let stack = config.device_stack()?;
    let response = stack.client.execute(&request).await?;

    match cli.format {
        OutputFormat::Text => {
            println!("HTTP {}", response.status);
            match response.json() {
                Some(json) => println!("{}", serde_json::to_string_pretty(json)?),
                None => println!("{}", response.text()),
            }
        }
        OutputFormat::Json => {
            let mut reply = serde_json::json!({
                "status": response.status,
                "data": response.to_json(),
            });
            if !response.is_success() {
                reply["error"] = serde_json::Value::String(response.error_message());
            }
            println!("{}", reply);
        }
    }

    if !response.is_success() {
        bail!("{}", response.error_message());
    }
    Ok(())
}

async fn cmd_identify(cli: &Cli, config: &AgentConfig, ip: Ipv4Addr, device: &DeviceArgs) -> Result<()> {
    let stack = config.device_stack()?;
    let options = config.scan.options();
    let found = scanner::probe(
        &stack.client,
        &options.scheme,
        ip,
        &device.credentials(),
        options.probe_timeout,
    )
    .await;

    match (cli.format, &found) {
        (OutputFormat::Text, Some(d)) => {
            println!("Address:       {}", d.ip);
            println!("Brand:         {}", d.vendor_brand);
            println!("Model:         {}", d.model);
            println!("Serial:        {}", d.serial_number);
            println!("Type:          {} ({:?})", d.product_type, d.device_kind);
            println!("Architecture:  {}", d.architecture.as_deref().unwrap_or("-"));
        }
        (OutputFormat::Text, None) => {
            println!("No supported device answered at {}", ip);
        }
        (OutputFormat::Json, _) => {
            println!(
                "{}",
                serde_json::json!({ "ip": ip.to_string(), "device": found })
            );
        }
    }

    Ok(())
}

struct DeployOptions<'a> {
    license_key: &'a str,
    installer_config: Option<&'a Path>,
    package: Option<&'a Path>,
    license_xml: Option<&'a Path>,
}

async fn cmd_deploy(
    cli: &Cli,
    config: &AgentConfig,
    ips: &[String],
    device: &DeviceArgs,
    options: DeployOptions<'_>,
) -> Result<()> {
    let installer_config = match options.installer_config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {:?}", path))?
        }
        None => serde_json::Value::Null,
    };
    let license_xml = options
        .license_xml
        .map(|path| {
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
        })
        .transpose()?;
    let package = match options.package {
        Some(path) => {
            let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "package.eap".to_string());
            PackageDescriptor::Inline {
                name,
                data: Arc::new(data),
            }
        }
        None => PackageDescriptor::Latest,
    };

    let stack = config.device_stack()?;
    let orchestrator = config.orchestrator(&stack, license_xml);

    let jobs: Vec<DeploymentJob> = ips
        .iter()
        .map(|ip| {
            DeploymentJob::new(
                ip.as_str(),
                device.credentials(),
                options.license_key,
                installer_config.clone(),
            )
            .with_package(package.clone())
        })
        .collect();

    let on_progress: Option<DeployProgressCallback> = match cli.format {
        OutputFormat::Text => Some(Arc::new(|p: DeployProgress| {
            eprintln!("  {:15} [{:>3}%] {}: {}", p.ip, p.percent, p.stage_label, p.message);
        })),
        OutputFormat::Json => None,
    };

    let results = deploy_many(&orchestrator, jobs, config.deploy.concurrency, on_progress).await;
    let failed = results.iter().filter(|r| r.result.is_err()).count();

    match cli.format {
        OutputFormat::Text => {
            println!();
            for result in &results {
                match &result.result {
                    Ok(report) => {
                        let notes: Vec<String> = report
                            .stages
                            .iter()
                            .filter_map(|r| match &r.outcome {
                                StageOutcome::Recovered(d) | StageOutcome::Skipped(d) => {
                                    Some(format!("{}: {}", r.stage.name(), d))
                                }
                                _ => None,
                            })
                            .collect();
                        println!(
                            "  {:15} OK   {} ({:.1}s)",
                            result.ip, report.device.model, report.elapsed_secs
                        );
                        for note in notes {
                            println!("  {:15}      {}", "", note);
                        }
                    }
                    Err(e) => println!("  {:15} FAIL {}", result.ip, e),
                }
            }
            println!();
            println!("{} succeeded, {} failed", results.len() - failed, failed);
        }
        OutputFormat::Json => {
            let entries: Vec<serde_json::Value> = results
                .iter()
                .map(|r| match &r.result {
                    Ok(report) => serde_json::json!({
                        "ip": r.ip,
                        "success": true,
                        "report": report,
                    }),
                    Err(e) => serde_json::json!({
                        "ip": r.ip,
                        "success": false,
                        "stage": e.stage,
                        "error": e.to_string(),
                    }),
                })
                .collect();
            println!("{}", serde_json::json!({ "results": entries }));
        }
    }

    if failed > 0 {
        bail!("{} of {} deployments failed", failed, results.len());
    }
    Ok(())
}

fn cmd_pins(cli: &Cli, config: &AgentConfig, action: &PinsAction) -> Result<()> {
    let store = config.pin_store();

    match action {
        PinsAction::List => {
            let mut records = store.records();
            records.sort_by(|a, b| a.host.cmp(&b.host));
            match cli.format {
                OutputFormat::Text => {
                    if records.is_empty() {
                        println!("No pinned certificates.");
                    }
                    for record in &records {
                        println!(
                            "  {:24} {}  {}",
                            record.host,
                            record.first_seen.format("%Y-%m-%d %H:%M"),
                            record.sha256_fingerprint
                        );
                    }
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "pins": records }));
                }
            }
        }
        PinsAction::Forget { host } => {
            let removed = store.forget(host)?;
            match cli.format {
                OutputFormat::Text if removed => println!("Forgot certificate for {}", host),
                OutputFormat::Text => println!("No certificate pinned for {}", host),
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::json!({ "host": host, "removed": removed })
                    );
                }
            }
        }
    }

    Ok(())
}

fn cmd_config(cli: &Cli, config: &AgentConfig) -> Result<()> {
    let config_path = config::get_config_file_path_string();
    let pin_store = config
        .tls
        .pin_store_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(memory only)".to_string());
    let packages = config
        .deploy
        .release_manifest_url
        .clone()
        .unwrap_or_else(|| "(local package directory)".to_string());

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config_path);
            println!("Loaded from:      {}", config.source);
            println!("Service address:  {}:{}", config.service.bind, config.service.port);
            println!("Pin policy:       {}", config.tls.pin_policy);
            println!("Pin store:        {}", pin_store);
            println!("Packages:         {}", packages);
            println!();
            println!("Environment variables:");
            println!("  CAMDEPLOY_PORT, CAMDEPLOY_BIND       - Service address");
            println!("  CAMDEPLOY_PIN_POLICY                 - warn | enforce");
            println!("  CAMDEPLOY_RELEASE_URL                - Package source");
            println!("  CAMDEPLOY_SIGNER_URL                 - License signing service");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config_path,
                    "source": config.source.to_string(),
                    "service": config.service,
                    "pin_policy": config.tls.pin_policy,
                    "pin_store": pin_store,
                    "packages": packages,
                })
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_reports_every_family_unless_asked() {
        let cli = Cli::try_parse_from(["camdeploy", "scan", "10.0.0.0/24", "-p", "pw"]).unwrap();
        assert!(matches!(cli.command, Commands::Scan { cameras_only: false, .. }));

        let cli = Cli::try_parse_from([
            "camdeploy",
            "scan",
            "10.0.0.0/24",
            "--cameras-only",
            "-p",
            "pw",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Scan { cameras_only: true, .. }));
    }
}
