//! Network namespace handling
//!
//! `setns(2)` switches the namespace of the calling thread only. Every link
//! operation therefore runs on one dedicated OS thread owned by
//! [`NetnsWorker`], which enters the target namespace, runs the job and
//! switches back before taking the next one. No other code ever changes the
//! namespace of a thread.

use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{CniError, Result};

/// Path of a container network namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetNs {
    path: PathBuf,
}

impl NetNs {
    /// Open a namespace by path. The path has to exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::metadata(path).map_err(|e| {
            CniError::Interface(format!("failed to open netns {}: {}", path.display(), e))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Display for NetNs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Moves the current thread between network namespaces
pub trait NamespaceSwitch {
    /// Enter the namespace at `target`.
    fn enter(&mut self, target: &Path) -> Result<()>;

    /// Return to the namespace the switch was created in.
    fn restore(&mut self) -> Result<()>;
}

/// `setns(2)` based switch
pub struct SetnsSwitch {
    origin: RawFd,
}

impl SetnsSwitch {
    /// Remember the calling thread's namespace as the origin.
    pub fn new() -> Result<Self> {
        let origin = open_ns("/proc/thread-self/ns/net")?;
        Ok(Self { origin })
    }
}

impl NamespaceSwitch for SetnsSwitch {
    fn enter(&mut self, target: &Path) -> Result<()> {
        let fd = open_ns(target)?;
        let entered = setns(fd, CloneFlags::CLONE_NEWNET);
        let _ = close(fd);

        entered.map_err(|e| {
            CniError::Interface(format!("failed to enter netns {}: {}", target.display(), e))
        })
    }

    fn restore(&mut self) -> Result<()> {
        setns(self.origin, CloneFlags::CLONE_NEWNET)
            .map_err(|e| CniError::Interface(format!("failed to restore host netns: {}", e)))
    }
}

impl Drop for SetnsSwitch {
    fn drop(&mut self) {
        let _ = close(self.origin);
    }
}

fn open_ns(path: impl AsRef<Path>) -> Result<RawFd> {
    let path = path.as_ref();
    open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()).map_err(|e| {
        CniError::Interface(format!("failed to open netns {}: {}", path.display(), e))
    })
}

/// Switch that could not be created; every namespace entry fails.
struct BrokenSwitch(String);

impl NamespaceSwitch for BrokenSwitch {
    fn enter(&mut self, _target: &Path) -> Result<()> {
        Err(CniError::Interface(self.0.clone()))
    }

    fn restore(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Returns false when the worker must stop.
type Job = Box<dyn FnOnce(&mut dyn NamespaceSwitch) -> bool + Send>;

/// Dedicated thread for everything that touches links or namespaces.
pub struct NetnsWorker {
    jobs: mpsc::UnboundedSender<Job>,
}

impl NetnsWorker {
    /// Start a worker using `setns(2)`.
    pub fn spawn() -> Result<Self> {
        Self::with_switch(|| Ok(Box::new(SetnsSwitch::new()?) as Box<dyn NamespaceSwitch>))
    }

    /// Start a worker whose switch is built on the worker thread itself.
    pub fn with_switch<F>(factory: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn NamespaceSwitch>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        thread::Builder::new()
            .name("netns-worker".to_string())
            .spawn(move || {
                let mut switch = factory().unwrap_or_else(|e| {
                    error!("Namespace switch unavailable: {}", e);
                    Box::new(BrokenSwitch(e.to_string()))
                });

                while let Some(job) = rx.blocking_recv() {
                    if !job(switch.as_mut()) {
                        error!("Worker thread is stuck outside the host namespace, stopping");
                        break;
                    }
                }
                debug!("Namespace worker exiting");
            })?;

        Ok(Self { jobs: tx })
    }

    /// Run `f` on the worker inside the namespace at `netns`.
    pub async fn run_in<T, F>(&self, netns: &Path, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let target = netns.to_path_buf();
        let (reply, response) = oneshot::channel();

        self.submit(Box::new(move |switch: &mut dyn NamespaceSwitch| {
            if let Err(e) = switch.enter(&target) {
                let _ = reply.send(Err(e));
                return true;
            }

            let result = f();

            match switch.restore() {
                Ok(()) => {
                    let _ = reply.send(result);
                    true
                }
                Err(e) => {
                    error!("{}", e);
                    let _ = reply.send(result);
                    false
                }
            }
        }))?;

        response.await.map_err(|_| worker_gone())?
    }

    /// Run `f` on the worker in the host namespace.
    pub async fn run_on_host<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();

        self.submit(Box::new(move |_: &mut dyn NamespaceSwitch| {
            let _ = reply.send(f());
            true
        }))?;

        response.await.map_err(|_| worker_gone())?
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.jobs.send(job).map_err(|_| worker_gone())
    }
}

fn worker_gone() -> CniError {
    CniError::Interface("namespace worker has stopped".into())
}
