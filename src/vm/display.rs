// Remote-Display Adapter
//
// Starts a network endpoint for a running VM's framebuffer and hands back the
// connection URL. `VncRelayDisplay` listens on the configured bind address and
// relays each client connection to the endpoint the hypervisor exposes.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("Display port {port} is already in use; try port {suggested} or 0 for automatic assignment")]
    PortInUse { port: u16, suggested: u16 },

    #[error("Requested display port {requested} but the listener was assigned {assigned}")]
    PortMismatch { requested: u16, assigned: u16 },

    #[error("VM '{0}' exposes no display endpoint")]
    Unavailable(String),

    #[error("Display failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait RemoteDisplay: Send + Sync {
    /// Serve `target` for `vm`, on `port` if given, else an automatic port.
    /// Returns the connection URL once the listener is bound.
    async fn start(&self, vm: &str, target: SocketAddr, port: Option<u16>) -> Result<String, DisplayError>;

    /// Stop serving `vm`. Stopping an unknown VM is a no-op.
    async fn stop(&self, vm: &str) -> Result<(), DisplayError>;

    /// Launch the local viewer for `url`.
    async fn open_client(&self, url: &str) -> Result<(), DisplayError>;
}

struct RelaySession {
    task: JoinHandle<()>,
}

pub struct VncRelayDisplay {
    bind_address: IpAddr,
    sessions: Mutex<HashMap<String, RelaySession>>,
}

impl VncRelayDisplay {
    pub fn new(bind_address: IpAddr) -> Self {
        Self {
            bind_address,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn take_session(&self, vm: &str) -> Option<RelaySession> {
        lock(&self.sessions).remove(vm)
    }
}

impl Drop for VncRelayDisplay {
    fn drop(&mut self) {
        for (_, session) in lock(&self.sessions).drain() {
            session.task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn url_for(addr: SocketAddr) -> String {
    format!("vnc://{}", addr)
}

/// Pause after the n-th consecutive accept failure: 50ms doubling up to 1s.
fn accept_retry_delay(failures: u32) -> Duration {
    let base = Duration::from_millis(50);
    base.saturating_mul(1 << failures.saturating_sub(1).min(5))
        .min(Duration::from_secs(1))
}

fn bind_error(port: u16, e: std::io::Error) -> DisplayError {
    if e.kind() == std::io::ErrorKind::AddrInUse {
        DisplayError::PortInUse {
            port,
            suggested: port.checked_add(1).unwrap_or(0),
        }
    } else {
        DisplayError::Failed(format!("bind port {}: {}", port, e))
    }
}

#[async_trait]
impl RemoteDisplay for VncRelayDisplay {
    async fn start(&self, vm: &str, target: SocketAddr, port: Option<u16>) -> Result<String, DisplayError> {
        if let Some(previous) = self.take_session(vm) {
            previous.task.abort();
        }

        let requested = port.unwrap_or(0);
        let listener = TcpListener::bind((self.bind_address, requested))
            .await
            .map_err(|e| bind_error(requested, e))?;
        let local = listener
            .local_addr()
            .map_err(|e| DisplayError::Failed(e.to_string()))?;
        if requested != 0 && local.port() != requested {
            return Err(DisplayError::PortMismatch {
                requested,
                assigned: local.port(),
            });
        }

        let name = vm.to_string();
        let task = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let (mut inbound, peer) = match listener.accept().await {
                    Ok(conn) => {
                        failures = 0;
                        conn
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = accept_retry_delay(failures);
                        warn!(vm = %name, error = %e, retry_in = ?delay, "Display accept failed");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                };
                debug!(vm = %name, %peer, "Display client connected");
                let vm = name.clone();
                tokio::spawn(async move {
                    match TcpStream::connect(target).await {
                        Ok(mut outbound) => {
                            if let Err(e) =
                                tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await
                            {
                                debug!(vm = %vm, error = %e, "Display relay closed");
                            }
                        }
                        Err(e) => warn!(vm = %vm, %target, error = %e, "Display endpoint unreachable"),
                    }
                });
            }
        });

        lock(&self.sessions).insert(vm.to_string(), RelaySession { task });
        let url = url_for(local);
        info!(vm = %vm, url = %url, "Display relay started");
        Ok(url)
    }

    async fn stop(&self, vm: &str) -> Result<(), DisplayError> {
        if let Some(session) = self.take_session(vm) {
            session.task.abort();
            info!(vm = %vm, "Display relay stopped");
        }
        Ok(())
    }

    async fn open_client(&self, url: &str) -> Result<(), DisplayError> {
        let opener = if cfg!(target_os = "macos") { "open" } else { "xdg-open" };
        let status = tokio::process::Command::new(opener)
            .arg(url)
            .status()
            .await
            .map_err(|e| DisplayError::Failed(format!("{}: {}", opener, e)))?;
        if !status.success() {
            return Err(DisplayError::Failed(format!("{} exited with {}", opener, status)));
        }
        Ok(())
    }
}

/// Recording display fake. Hands out sequential ports and can simulate
/// occupied ones.
pub struct MockDisplay {
    next_port: Mutex<u16>,
    occupied: Mutex<HashSet<u16>>,
    active: Mutex<HashMap<String, String>>,
    opened: Mutex<Vec<String>>,
}

impl Default for MockDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDisplay {
    pub fn new() -> Self {
        Self {
            next_port: Mutex::new(5901),
            occupied: Mutex::new(HashSet::new()),
            active: Mutex::new(HashMap::new()),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn occupy(&self, port: u16) {
        lock(&self.occupied).insert(port);
    }

    pub fn active_url(&self, vm: &str) -> Option<String> {
        lock(&self.active).get(vm).cloned()
    }

    pub fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }
}

#[async_trait]
impl RemoteDisplay for MockDisplay {
    async fn start(&self, vm: &str, _target: SocketAddr, port: Option<u16>) -> Result<String, DisplayError> {
        let port = match port.filter(|p| *p != 0) {
            Some(p) if lock(&self.occupied).contains(&p) => {
                return Err(DisplayError::PortInUse {
                    port: p,
                    suggested: p.checked_add(1).unwrap_or(0),
                });
            }
            Some(p) => p,
            None => {
                let mut next = lock(&self.next_port);
                while lock(&self.occupied).contains(&*next) {
                    *next += 1;
                }
                let p = *next;
                *next += 1;
                p
            }
        };
        let url = format!("vnc://127.0.0.1:{}", port);
        lock(&self.active).insert(vm.to_string(), url.clone());
        lock(&self.occupied).insert(port);
        Ok(url)
    }

    async fn stop(&self, vm: &str) -> Result<(), DisplayError> {
        if let Some(url) = lock(&self.active).remove(vm) {
            if let Some(port) = url.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()) {
                lock(&self.occupied).remove(&port);
            }
        }
        Ok(())
    }

    async fn open_client(&self, url: &str) -> Result<(), DisplayError> {
        lock(&self.opened).push(url.to_string());
        Ok(())
    }
}
