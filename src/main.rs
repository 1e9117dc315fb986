// vmkeeper - Main Entry Point
//
// CLI front end over the lifecycle controller and image puller:
// - VM commands: create, clone, get, set, list, run, stop, pause, resume, delete
// - Image commands: pull, images, prune, ipsw
// - serve: HTTP API
// - config: storage locations and cache directory
//
// Running VMs belong to the process that started them: a foreground
// `vmkeeper run` or `vmkeeper serve`. `--server` sends lifecycle commands to
// a running API server instead of acting locally.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use vmkeeper::cancel::CancelToken;
use vmkeeper::config::Settings;
use vmkeeper::registry::ImageRecord;
use vmkeeper::server;
use vmkeeper::units::{format_size, parse_size};
use vmkeeper::vm::display::{MockDisplay, RemoteDisplay, VncRelayDisplay};
use vmkeeper::vm::mock::MockHypervisor;
use vmkeeper::vm::session::SharedDirectory;
use vmkeeper::vm::vfkit::VfkitHypervisor;
use vmkeeper::vm::{
    Controller, CreateOptions, Hypervisor, OsKind, Resolution, RunOptions, RuntimeState, VmConfigUpdate,
    VmDetails, VmSource,
};

/// vmkeeper: local VM lifecycle manager and registry image puller
#[derive(Parser, Debug)]
#[command(name = "vmkeeper")]
#[command(author = "vmkeeper Contributors")]
#[command(version)]
#[command(about = "Create, run and clone local VMs from registry images", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (default: ~/.config/vmkeeper/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Send lifecycle commands to a running API server, e.g. http://127.0.0.1:7777
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a VM
    Create {
        name: String,
        /// Guest OS: linux or macOS
        #[arg(long)]
        os: Option<String>,
        #[arg(long)]
        cpu: Option<u32>,
        /// Memory size, e.g. 4GB (bare numbers are MB)
        #[arg(long)]
        memory: Option<String>,
        /// Disk size, e.g. 50GB (bare numbers are MB)
        #[arg(long)]
        disk_size: Option<String>,
        /// Display resolution, WIDTHxHEIGHT
        #[arg(long)]
        display: Option<String>,
        /// Storage location name or directory
        #[arg(long)]
        location: Option<String>,
        /// Materialize from a registry image (pulled if not local)
        #[arg(long, conflicts_with = "from_ipsw")]
        from_image: Option<String>,
        /// Install macOS from a restore image
        #[arg(long)]
        from_ipsw: Option<PathBuf>,
    },
    /// Pull an image into the local image store
    Pull {
        reference: String,
        /// Also create a VM with this name from the image
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
    /// List locally stored images
    Images {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Copy a VM into a new independent VM
    Clone {
        source: String,
        destination: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        destination_location: Option<String>,
    },
    /// Show a VM's configuration and state
    Get {
        name: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Change a stopped VM's settings
    Set {
        name: String,
        #[arg(long)]
        cpu: Option<u32>,
        #[arg(long)]
        memory: Option<String>,
        /// New disk size; the disk can only grow
        #[arg(long)]
        disk_size: Option<String>,
        #[arg(long)]
        display: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
    /// List VMs
    #[command(alias = "ls")]
    List {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Start a VM and stay in the foreground until it stops or Ctrl-C
    Run {
        name: String,
        /// Do not start a remote display session
        #[arg(long)]
        no_display: bool,
        /// Remote display port (0 or unset picks one)
        #[arg(long)]
        display_port: Option<u16>,
        /// Open the display client once the session is up
        #[arg(long)]
        open: bool,
        /// Attach an installer ISO
        #[arg(long)]
        iso: Option<PathBuf>,
        /// Share a host directory: [TAG=]PATH[:ro]
        #[arg(long = "dir")]
        dirs: Vec<String>,
        #[arg(long)]
        location: Option<String>,
        /// Create the VM from this image first if it does not exist
        #[arg(long)]
        image: Option<String>,
    },
    /// Gracefully stop a running VM
    Stop {
        name: String,
        #[arg(long)]
        location: Option<String>,
    },
    /// Pause a running VM
    Pause {
        name: String,
        #[arg(long)]
        location: Option<String>,
    },
    /// Resume a paused VM
    Resume {
        name: String,
        #[arg(long)]
        location: Option<String>,
    },
    /// Delete a stopped VM
    Delete {
        name: String,
        #[arg(long)]
        location: Option<String>,
    },
    /// Remove unreferenced cached blobs and stale downloads
    Prune {
        /// Remove every stored image first
        #[arg(long)]
        all: bool,
    },
    /// Print the latest macOS restore image URL
    Ipsw,
    /// Start the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Use the in-memory hypervisor and display fakes
        #[arg(long)]
        mock: bool,
    },
    /// Show or change host settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective settings
    Show,
    /// Register a storage location
    AddLocation { name: String, path: PathBuf },
    /// Forget a storage location (its VMs stay on disk)
    RemoveLocation { name: String },
    /// Use a location when commands do not name one
    SetDefault { name: String },
    /// Move the image cache
    SetCacheDir { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings_path = args.config.clone().unwrap_or_else(Settings::config_path);
    let settings = Settings::load_from_path(&settings_path)?;
    init_tracing(args.verbose, &settings)?;

    if let Some(url) = &args.server {
        return run_remote(url, args.command).await;
    }

    match args.command {
        Commands::Config { action } => config_command(settings, &settings_path, action),
        Commands::Serve { host, port, mock } => {
            let (hypervisor, display) = adapters(&settings, mock)?;
            let controller = Arc::new(Controller::from_settings(&settings, hypervisor, display)?);
            let host = host.unwrap_or_else(|| settings.server.host.clone());
            let ip: IpAddr = host
                .parse()
                .with_context(|| format!("Invalid server host '{}'", host))?;
            let addr = SocketAddr::new(ip, port.unwrap_or(settings.server.port));

            let shutdown = CancelToken::new();
            cancel_on_ctrl_c(shutdown.clone());
            info!(hypervisor = %controller.hypervisor_name(), "vmkeeper v{} serving", env!("CARGO_PKG_VERSION"));
            let served = server::serve(controller.clone(), addr, shutdown).await;
            controller.shutdown().await;
            served
        }
        command => {
            let (hypervisor, display) = adapters(&settings, false)?;
            let controller = Controller::from_settings(&settings, hypervisor, display)?;
            run_local(&controller, command).await
        }
    }
}

fn init_tracing(verbose: bool, settings: &Settings) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { settings.log_level()? };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match settings.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

fn adapters(settings: &Settings, mock: bool) -> Result<(Arc<dyn Hypervisor>, Arc<dyn RemoteDisplay>)> {
    if mock {
        warn!("Using in-memory hypervisor and display fakes");
        return Ok((Arc::new(MockHypervisor::new()), Arc::new(MockDisplay::new())));
    }
    let bind: IpAddr = settings
        .display
        .bind_address
        .parse()
        .with_context(|| format!("Invalid display bind address '{}'", settings.display.bind_address))?;
    Ok((Arc::new(VfkitHypervisor::new()), Arc::new(VncRelayDisplay::new(bind))))
}

fn cancel_on_ctrl_c(token: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            token.cancel();
        }
    });
}

fn size_arg(value: Option<&str>) -> Result<Option<u64>> {
    value
        .map(|s| parse_size(s).with_context(|| format!("Invalid size '{}'", s)))
        .transpose()
}

fn display_arg(value: Option<&str>) -> Result<Option<Resolution>> {
    Ok(value.map(str::parse::<Resolution>).transpose()?)
}

async fn run_local(controller: &Controller, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            name,
            os,
            cpu,
            memory,
            disk_size,
            display,
            location,
            from_image,
            from_ipsw,
        } => {
            let source = match (from_image, from_ipsw) {
                (Some(image), _) => VmSource::Image(image),
                (None, Some(ipsw)) => VmSource::Installer(ipsw),
                (None, None) => VmSource::Blank,
            };
            let options = CreateOptions {
                os: os.as_deref().map(str::parse::<OsKind>).transpose()?,
                cpu_count: cpu,
                memory_size: size_arg(memory.as_deref())?,
                disk_size: size_arg(disk_size.as_deref())?,
                display: display_arg(display.as_deref())?,
                location,
                source,
            };
            let cancel = CancelToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let details = controller.create(&name, options, &cancel).await?;
            println!("Created {} in {}", details.name, details.path.display());
        }
        Commands::Pull {
            reference,
            name,
            location,
        } => {
            let cancel = CancelToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let (record, vm) = controller
                .pull(&reference, name.as_deref(), location.as_deref(), &cancel)
                .await?;
            println!(
                "Pulled {} ({}, {} parts)",
                record.reference,
                format_size(record.uncompressed_size),
                record.digests.len()
            );
            if let Some(vm) = vm {
                println!("Created {} in {}", vm.name, vm.path.display());
            }
        }
        Commands::Images { format } => {
            let images = controller.puller()?.images().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&images)?),
                OutputFormat::Text => print_images(&images),
            }
        }
        Commands::Clone {
            source,
            destination,
            location,
            destination_location,
        } => {
            let details = controller
                .clone_vm(
                    &source,
                    &destination,
                    location.as_deref(),
                    destination_location.as_deref(),
                )
                .await?;
            println!("Cloned {} to {}", source, details.name);
        }
        Commands::Get { name, location, format } => {
            let details = controller.get(&name, location.as_deref()).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&details)?),
                OutputFormat::Text => print_details(&details),
            }
        }
        Commands::Set {
            name,
            cpu,
            memory,
            disk_size,
            display,
            location,
        } => {
            let update = VmConfigUpdate {
                cpu_count: cpu,
                memory_size: size_arg(memory.as_deref())?,
                disk_size: size_arg(disk_size.as_deref())?,
                display: display_arg(display.as_deref())?,
            };
            let config = controller
                .update_settings(&name, location.as_deref(), &update)
                .await?;
            println!(
                "{}: {} CPUs, {} memory, {} disk, {}",
                name,
                config.cpu_count,
                format_size(config.memory_size),
                format_size(config.disk_size),
                config.display
            );
        }
        Commands::List { format } => {
            let vms = controller.list().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&vms)?),
                OutputFormat::Text => print_list(&vms),
            }
        }
        Commands::Run {
            name,
            no_display,
            display_port,
            open,
            iso,
            dirs,
            location,
            image,
        } => {
            let shared_directories = dirs
                .iter()
                .map(|d| d.parse::<SharedDirectory>())
                .collect::<Result<Vec<_>, _>>()?;
            let options = RunOptions {
                display: !no_display,
                display_port,
                open_client: open,
                iso,
                shared_directories,
                location: location.clone(),
                image,
            };
            run_foreground(controller, &name, location.as_deref(), options).await?;
        }
        Commands::Stop { name, location } => {
            controller.stop(&name, location.as_deref()).await?;
            println!("Stopped {}", name);
        }
        Commands::Pause { name, location } => {
            controller.pause(&name, location.as_deref()).await?;
            println!("Paused {}", name);
        }
        Commands::Resume { name, location } => {
            controller.resume(&name, location.as_deref()).await?;
            println!("Resumed {}", name);
        }
        Commands::Delete { name, location } => {
            controller.delete(&name, location.as_deref()).await?;
            println!("Deleted {}", name);
        }
        Commands::Prune { all } => {
            let report = controller.puller()?.prune(all).await?;
            println!(
                "Removed {} images, {} blobs, {} stale downloads ({} reclaimed)",
                report.removed_images,
                report.removed_blobs,
                report.removed_temp_files,
                format_size(report.reclaimed_bytes)
            );
        }
        Commands::Ipsw => {
            println!("{}", controller.latest_restore_image_url().await?);
        }
        Commands::Serve { .. } | Commands::Config { .. } => bail!("command needs no VM controller"),
    }
    Ok(())
}

/// Start `name`, then wait until the guest stops or the user interrupts,
/// in which case the VM is stopped gracefully.
async fn run_foreground(
    controller: &Controller,
    name: &str,
    location: Option<&str>,
    options: RunOptions,
) -> Result<()> {
    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let details = controller.run(name, options, &cancel).await?;
    match &details.display_url {
        Some(url) => println!("{} is running; display at {}", name, url),
        None => println!("{} is running", name),
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = controller.stop(name, location).await {
                    warn!(vm = %name, error = %e, "Stop after interrupt failed");
                    return Err(e.into());
                }
                println!("Stopped {}", name);
                return Ok(());
            }
            _ = ticker.tick() => {
                let current = controller.get(name, location).await?;
                if current.state == RuntimeState::Stopped {
                    println!("{} has shut down", name);
                    return Ok(());
                }
            }
        }
    }
}

fn config_command(mut settings: Settings, settings_path: &std::path::Path, action: Option<ConfigAction>) -> Result<()> {
    match action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => {
            println!("# {}", settings_path.display());
            print!("{}", toml::to_string_pretty(&settings)?);
            return Ok(());
        }
        ConfigAction::AddLocation { name, path } => settings.add_location(&name, &path)?,
        ConfigAction::RemoveLocation { name } => settings.remove_location(&name)?,
        ConfigAction::SetDefault { name } => settings.set_default_location(&name)?,
        ConfigAction::SetCacheDir { path } => {
            settings.cache.directory = path.display().to_string();
        }
    }
    settings.save_to_path(settings_path)?;
    println!("Saved {}", settings_path.display());
    Ok(())
}

fn print_details(details: &VmDetails) {
    let config = &details.config;
    println!("name:      {}", details.name);
    println!("location:  {} ({})", details.location, details.path.display());
    println!("state:     {}", details.state);
    println!("os:        {}", config.os);
    println!("cpu:       {}", config.cpu_count);
    println!("memory:    {}", format_size(config.memory_size));
    println!("disk:      {}", format_size(config.disk_size));
    if let Some(usage) = &details.disk_usage {
        println!("allocated: {}", format_size(usage.allocated));
    }
    println!("display:   {}", config.display);
    println!("mac:       {}", config.mac_address);
    if let Some(url) = &details.display_url {
        println!("url:       {}", url);
    }
}

fn print_list(vms: &[VmDetails]) {
    println!("{:<10} {:<24} {:<8} {:>4} {:>8} {:>8}", "LOCATION", "NAME", "STATE", "CPU", "MEMORY", "DISK");
    for vm in vms {
        println!(
            "{:<10} {:<24} {:<8} {:>4} {:>8} {:>8}",
            vm.location,
            vm.name,
            vm.state.to_string(),
            vm.config.cpu_count,
            format_size(vm.config.memory_size),
            format_size(vm.config.disk_size)
        );
    }
}

fn print_images(images: &[ImageRecord]) {
    println!("{:<32} {:>10} {:>6}  {}", "IMAGE", "SIZE", "PARTS", "PULLED");
    for image in images {
        println!(
            "{:<32} {:>10} {:>6}  {}",
            image.reference.to_string(),
            format_size(image.uncompressed_size),
            image.digests.len(),
            image.pulled_at.format("%Y-%m-%d %H:%M")
        );
    }
}

// ---- remote mode -------------------------------------------------------------

async fn run_remote(base: &str, command: Commands) -> Result<()> {
    let client = reqwest::Client::new();

    let (method, url, body) = match &command {
        Commands::Run {
            name,
            no_display,
            display_port,
            iso,
            dirs,
            location,
            image,
            ..
        } => (
            reqwest::Method::POST,
            remote_url(base, &[name.as_str(), "run"], location.as_deref())?,
            json!({
                "display": !no_display,
                "port": display_port,
                "iso": iso,
                "sharedDirectories": dirs,
                "image": image,
            }),
        ),
        Commands::Stop { name, location } => (
            reqwest::Method::POST,
            remote_url(base, &[name.as_str(), "stop"], location.as_deref())?,
            Value::Null,
        ),
        Commands::Pause { name, location } => (
            reqwest::Method::POST,
            remote_url(base, &[name.as_str(), "pause"], location.as_deref())?,
            Value::Null,
        ),
        Commands::Resume { name, location } => (
            reqwest::Method::POST,
            remote_url(base, &[name.as_str(), "resume"], location.as_deref())?,
            Value::Null,
        ),
        Commands::Get { name, location, .. } => (
            reqwest::Method::GET,
            remote_url(base, &[name.as_str()], location.as_deref())?,
            Value::Null,
        ),
        Commands::List { .. } => (reqwest::Method::GET, remote_url(base, &[], None)?, Value::Null),
        Commands::Delete { name, location } => (
            reqwest::Method::DELETE,
            remote_url(base, &[name.as_str()], location.as_deref())?,
            Value::Null,
        ),
        other => bail!("{:?} is not available with --server", other),
    };

    let mut request = client.request(method, url.clone());
    if !body.is_null() {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v["error"].as_str().map(str::to_string))
            .unwrap_or(text);
        bail!("{} ({})", message, status);
    }
    if !text.is_empty() {
        let value: Value = serde_json::from_str(&text).context("Malformed server response")?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

/// `<base>/vms/<segments...>[?location=...]`, each part percent-encoded.
fn remote_url(base: &str, segments: &[&str], location: Option<&str>) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(base).with_context(|| format!("Invalid server URL '{}'", base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Server URL '{}' cannot carry a path", base))?
        .pop_if_empty()
        .push("vms")
        .extend(segments);
    if let Some(location) = location {
        url.query_pairs_mut().append_pair("location", location);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_url_encodes_parts() {
        let url = remote_url("http://127.0.0.1:8080/", &["my vm", "run"], Some("ext#1")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/vms/my%20vm/run?location=ext%231");

        let url = remote_url("http://host/api", &["a/b"], None).unwrap();
        assert_eq!(url.as_str(), "http://host/api/vms/a%2Fb");

        let url = remote_url("http://host", &[], None).unwrap();
        assert_eq!(url.as_str(), "http://host/vms");
    }

    #[test]
    fn test_remote_url_rejects_garbage() {
        assert!(remote_url("not a url", &["vm"], None).is_err());
        assert!(remote_url("mailto:someone@example.com", &["vm"], None).is_err());
    }
}
