//! Per-connection worker process supervisor.
//!
//! Launches the program's own image with `-type worker`, watches it, and
//! applies the exit-code policy: 0 ends the session, a defined error code is
//! surfaced once and never restarted, anything else (crash, signal, explicit
//! restart codes) relaunches after a short backoff. Only the first launch
//! re-runs streaming-params negotiation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lanthing_proto::error::{ErrorCode, WorkerExit, classify_worker_exit};
use lanthing_proto::messages::{VideoCodecType, codecs_to_csv};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

const RELAUNCH_BACKOFF: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to build the worker command line.
#[derive(Debug, Clone)]
pub struct WorkerLaunchSpec {
    pub program: PathBuf,
    pub pipe_name: String,
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub codecs: Vec<VideoCodecType>,
    pub monitor_index: u32,
}

/// CLI surface of the worker child.
pub fn build_args(spec: &WorkerLaunchSpec, negotiate: bool) -> Vec<String> {
    vec![
        "-type".to_string(),
        "worker".to_string(),
        "-name".to_string(),
        spec.pipe_name.clone(),
        "-width".to_string(),
        spec.width.to_string(),
        "-height".to_string(),
        spec.height.to_string(),
        "-freq".to_string(),
        spec.refresh_rate.to_string(),
        "-codecs".to_string(),
        codecs_to_csv(&spec.codecs),
        "-action".to_string(),
        "streaming".to_string(),
        "-mindex".to_string(),
        spec.monitor_index.to_string(),
        "-negotiate".to_string(),
        if negotiate { "1" } else { "0" }.to_string(),
    ]
}

/// Platform seam for actually spawning the child. The default re-executes
/// our own image; tests substitute a shell.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn spawn(&self, spec: &WorkerLaunchSpec, args: &[String]) -> std::io::Result<Child>;
}

pub struct DefaultLauncher;

impl WorkerLauncher for DefaultLauncher {
    fn spawn(&self, spec: &WorkerLaunchSpec, args: &[String]) -> std::io::Result<Child> {
        Command::new(&spec.program).args(args).spawn()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerProcessEvent {
    /// A defined init error; reported once, before `Stopped`. Mid-stream
    /// timeouts are not surfaced here.
    Failed(ErrorCode),
    /// The child is gone for good (no relaunch pending).
    Stopped,
}

enum SupervisorCmd {
    Stop,
    ChangeResolution {
        width: u32,
        height: u32,
        monitor_index: u32,
    },
}

/// Handle to the supervisor task.
#[derive(Clone)]
pub struct WorkerProcess {
    cmd_tx: mpsc::Sender<SupervisorCmd>,
}

impl WorkerProcess {
    pub fn launch(
        spec: WorkerLaunchSpec,
        launcher: Arc<dyn WorkerLauncher>,
        event_tx: mpsc::Sender<WorkerProcessEvent>,
    ) -> WorkerProcess {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        tokio::spawn(supervisor_task(spec, launcher, cmd_rx, event_tx));
        WorkerProcess { cmd_tx }
    }

    /// Terminate the child and stop supervising. `Stopped` follows.
    pub fn stop(&self) {
        let _ = self.cmd_tx.try_send(SupervisorCmd::Stop);
    }

    /// Replace the pending launch arguments and bounce the running child;
    /// the relaunch picks them up (without renegotiating).
    pub fn change_resolution(&self, width: u32, height: u32, monitor_index: u32) {
        let _ = self.cmd_tx.try_send(SupervisorCmd::ChangeResolution {
            width,
            height,
            monitor_index,
        });
    }
}

async fn supervisor_task(
    mut spec: WorkerLaunchSpec,
    launcher: Arc<dyn WorkerLauncher>,
    mut cmd_rx: mpsc::Receiver<SupervisorCmd>,
    event_tx: mpsc::Sender<WorkerProcessEvent>,
) {
    let mut first_launch = true;
    'relaunch: loop {
        let args = build_args(&spec, first_launch);
        first_launch = false;
        let mut child = match launcher.spawn(&spec, &args) {
            Ok(child) => child,
            Err(e) => {
                warn!("Launch worker process failed: {e}");
                tokio::time::sleep(RELAUNCH_BACKOFF).await;
                continue;
            }
        };
        info!(pid = child.id().unwrap_or(0), "Worker process launched");

        loop {
            tokio::select! {
                status = child.wait() => {
                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!("Wait for worker failed: {e}");
                            let _ = event_tx.send(WorkerProcessEvent::Stopped).await;
                            return;
                        }
                    };
                    info!(?code, "Worker process exited");
                    match classify_worker_exit(code) {
                        WorkerExit::Clean => {
                            let _ = event_tx.send(WorkerProcessEvent::Stopped).await;
                            return;
                        }
                        WorkerExit::Error(ec) => {
                            if ec != ErrorCode::WorkerKeepAliveTimeout {
                                let _ = event_tx.send(WorkerProcessEvent::Failed(ec)).await;
                            }
                            let _ = event_tx.send(WorkerProcessEvent::Stopped).await;
                            return;
                        }
                        WorkerExit::Restart => {
                            info!("Restarting worker");
                            tokio::time::sleep(RELAUNCH_BACKOFF).await;
                            continue 'relaunch;
                        }
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(SupervisorCmd::Stop) | None => {
                        terminate(&mut child).await;
                        let _ = event_tx.send(WorkerProcessEvent::Stopped).await;
                        return;
                    }
                    Some(SupervisorCmd::ChangeResolution { width, height, monitor_index }) => {
                        spec.width = width;
                        spec.height = height;
                        spec.monitor_index = monitor_index;
                        info!(width, height, monitor_index, "Bouncing worker for new resolution");
                        // Signal death classifies as Restart, which picks up
                        // the replaced arguments.
                        send_sigterm(&child);
                    }
                },
            }
        }
    }
}

fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

/// SIGTERM, bounded wait, then SIGKILL.
async fn terminate(child: &mut Child) {
    send_sigterm(child);
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => info!(?status, "Worker exited after SIGTERM"),
        Ok(Err(e)) => warn!("Error waiting for worker: {e}"),
        Err(_) => {
            warn!("Worker did not exit in time, killing");
            let _ = child.kill().await;
        }
    }
}
