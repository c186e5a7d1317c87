//! Process supervisor: keeps one OS process per worker alive.
//!
//! Workers are isolated processes spawned by re-executing this binary.
//! Liveness is judged out-of-band: the exit code must be unset and the OS
//! must still acknowledge the PID. Dead workers get a graceful-then-forced
//! termination of the stale handle and a relaunch with a bounded attempt
//! budget; worker status is mirrored to the store on every poll so the
//! report always reflects current truth.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::process::{Child, Command};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

use warden_core::error::{Result, WardenError};
use warden_core::metrics::{self, worker_status_key};
use warden_core::shutdown::ShutdownToken;
use warden_core::store::Store;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const TERM_GRACE: Duration = Duration::from_secs(3);
const MAX_LAUNCH_ATTEMPTS: u32 = 3;

pub trait WorkerSpawner {
    fn spawn(&self, worker: &str) -> io::Result<Child>;
}

/// Spawns workers by re-executing the daemon binary with the hidden `worker`
/// subcommand.
#[derive(Debug, Clone, Default)]
pub struct ExeSpawner;

impl WorkerSpawner for ExeSpawner {
    fn spawn(&self, worker: &str) -> io::Result<Child> {
        let exe = std::env::current_exe()?;
        Command::new(exe).arg("worker").arg(worker).spawn()
    }
}

struct WorkerSlot {
    name: &'static str,
    child: Option<Child>,
    launch_attempts: u32,
}

pub struct Supervisor<S: WorkerSpawner> {
    store: Store,
    spawner: S,
    slots: Vec<WorkerSlot>,
    poll_interval: Duration,
}

impl<S: WorkerSpawner> Supervisor<S> {
    pub fn new(store: Store, spawner: S, workers: &[&'static str]) -> Self {
        let slots = workers
            .iter()
            .map(|name| WorkerSlot {
                name,
                child: None,
                launch_attempts: 0,
            })
            .collect();
        Self {
            store,
            spawner,
            slots,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Launches every worker, then polls liveness until shutdown. Launch
    /// exhaustion and store faults on the status path are fatal.
    pub fn run(&mut self, token: &ShutdownToken) -> Result<()> {
        info!(pid = std::process::id(), "starting supervisor");
        for idx in 0..self.slots.len() {
            self.launch(idx)?;
        }

        while token.wait_timeout(self.poll_interval) {
            self.check_workers()?;
        }

        info!(pid = std::process::id(), "stopping supervisor");
        self.shutdown();
        Ok(())
    }

    fn launch(&mut self, idx: usize) -> Result<()> {
        let name = self.slots[idx].name;
        let status_key = worker_status_key(name);
        self.store.put(&status_key, metrics::STATUS_LAUNCHING)?;
        self.slots[idx].launch_attempts = 0;
        loop {
            info!(worker = %name, "launching worker process");
            match self.spawner.spawn(name) {
                Ok(child) => {
                    info!(worker = %name, pid = child.id(), "launched worker process");
                    self.slots[idx].child = Some(child);
                    self.slots[idx].launch_attempts = 0;
                    self.store.put(&status_key, metrics::STATUS_LAUNCHED)?;
                    return Ok(());
                }
                Err(err) => {
                    let slot = &mut self.slots[idx];
                    if slot.launch_attempts >= MAX_LAUNCH_ATTEMPTS {
                        error!(worker = %name, error = %err, "max launch attempts reached");
                        return Err(WardenError::LaunchFailed {
                            worker: name.to_string(),
                            attempts: slot.launch_attempts,
                        });
                    }
                    slot.launch_attempts += 1;
                    warn!(
                        worker = %name,
                        error = %err,
                        attempt = slot.launch_attempts,
                        max = MAX_LAUNCH_ATTEMPTS,
                        "worker launch failed, retrying"
                    );
                }
            }
        }
    }

    fn check_workers(&mut self) -> Result<()> {
        for idx in 0..self.slots.len() {
            let name = self.slots[idx].name;
            let status_key = worker_status_key(name);
            let alive = match self.slots[idx].child.as_mut() {
                Some(child) => is_running(child),
                None => false,
            };
            if alive {
                self.store.put(&status_key, metrics::STATUS_RUNNING)?;
                continue;
            }

            self.store.put(&status_key, metrics::STATUS_NOT_RUNNING)?;
            info!(worker = %name, "worker is not running");
            if let Some(child) = self.slots[idx].child.take() {
                close_process(name, child);
            }
            self.launch(idx)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for slot in &mut self.slots {
            if let Some(child) = slot.child.take() {
                close_process(slot.name, child);
            }
        }
    }
}

/// A worker is live iff its exit code is unset and the OS still acknowledges
/// the PID.
fn is_running(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(None) => pid_alive(child.id()),
        _ => false,
    }
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Graceful-then-forced termination: SIGTERM, wait up to the grace period,
/// SIGKILL if the worker is still alive. Always reaps the handle.
fn close_process(name: &str, mut child: Child) {
    let pid = child.id();
    info!(worker = %name, pid, "stopping worker");
    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(worker = %name, pid, error = %err, "failed to signal worker");
    }
    match child.wait_timeout(TERM_GRACE) {
        Ok(Some(status)) => debug!(worker = %name, pid, status = %status, "worker exited"),
        Ok(None) => {
            info!(worker = %name, pid, "worker still alive, sending SIGKILL");
            let _ = child.kill();
            let _ = child.wait();
        }
        Err(err) => {
            warn!(worker = %name, pid, error = %err, "failed to wait for worker, sending SIGKILL");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
