//! Render process supervision.
//!
//! Owns at most one live render subprocess at a time. Every start/stop
//! sequence runs under one lock, so overlapping change events serialize:
//! a change arriving mid-restart waits for the lock, then immediately
//! supersedes the job that just started. Also sweeps stray GPU-mode
//! renderer processes left behind by earlier invocations.

use crate::config::{RendererConfig, SweepConfig};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{ProcessExt, System, SystemExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The render job currently under supervision.
struct RenderJob {
    child: Child,
    file: PathBuf,
    scene: String,
}

/// Errors that can occur while managing the render subprocess.
#[derive(Debug)]
pub enum SupervisorError {
    /// Failed to spawn the renderer subprocess.
    Spawn { source: std::io::Error },
    /// Failed to wait on the renderer subprocess.
    Wait { source: std::io::Error },
    /// Forced kill of an unresponsive render process group failed.
    Kill { source: nix::Error },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn { source } => {
                write!(f, "failed to spawn renderer subprocess: {}", source)
            }
            SupervisorError::Wait { source } => {
                write!(f, "failed to wait on renderer subprocess: {}", source)
            }
            SupervisorError::Kill { source } => {
                write!(f, "failed to force-kill render process group: {}", source)
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source } => Some(source),
            SupervisorError::Wait { source } => Some(source),
            SupervisorError::Kill { source } => Some(source),
        }
    }
}

pub struct RenderSupervisor {
    renderer: RendererConfig,
    sweep: SweepConfig,
    job: Mutex<Option<RenderJob>>,
}

impl RenderSupervisor {
    pub fn new(renderer: RendererConfig, sweep: SweepConfig) -> Self {
        Self {
            renderer,
            sweep,
            job: Mutex::new(None),
        }
    }

    /// Stop whatever runs now (if anything) and launch a render for
    /// `file`/`scene`. The whole sequence holds the job lock.
    ///
    /// A change to the same file and scene tears down and relaunches just
    /// like a target switch — the distinction is logging only.
    pub async fn restart(&self, file: &Path, scene: &str) -> Result<(), SupervisorError> {
        let mut slot = self.job.lock().await;
        match slot.as_ref() {
            Some(job) if job.file == file && job.scene == scene => {
                info!(file = %file.display(), scene, "recreating render instance");
            }
            Some(_) => {
                info!(file = %file.display(), scene, "switching render target");
            }
            None => {}
        }
        stop_job(&mut slot, self.renderer.stop_timeout).await?;
        // The old job is already gone; only our own pid needs shielding.
        sweep_processes(&self.sweep, &[std::process::id() as i32]).await;
        *slot = Some(self.spawn_job(file, scene)?);
        Ok(())
    }

    fn spawn_job(&self, file: &Path, scene: &str) -> Result<RenderJob, SupervisorError> {
        let args = build_args(&self.renderer, file, scene);
        info!(file = %file.display(), scene, "launching render");
        let child = Command::new(&self.renderer.program)
            .args(&args)
            .env("PYTHONPATH", self.renderer.python_path())
            .process_group(0) // Own group, so termination takes helpers with it
            .spawn()
            .map_err(|e| SupervisorError::Spawn { source: e })?;
        debug!(pid = child.id().unwrap_or(0), "render subprocess started");
        Ok(RenderJob {
            child,
            file: file.to_path_buf(),
            scene: scene.to_string(),
        })
    }

    /// Terminate the active job, if any. Safe to call when idle.
    pub async fn stop_current(&self) -> Result<(), SupervisorError> {
        let mut slot = self.job.lock().await;
        stop_job(&mut slot, self.renderer.stop_timeout).await
    }

    /// File and scene of the active job, if any.
    pub async fn current_target(&self) -> Option<(PathBuf, String)> {
        let slot = self.job.lock().await;
        slot.as_ref().map(|j| (j.file.clone(), j.scene.clone()))
    }

    /// Pid of the active job's process, if any.
    #[cfg(test)]
    pub async fn current_pid(&self) -> Option<u32> {
        let slot = self.job.lock().await;
        slot.as_ref().and_then(|j| j.child.id())
    }

    /// Sweep stray GPU-mode renderer processes, sparing the active job.
    pub async fn sweep_strays(&self) -> usize {
        let exclude = {
            let slot = self.job.lock().await;
            let mut exclude = vec![std::process::id() as i32];
            if let Some(job) = slot.as_ref() {
                if let Some(pid) = job.child.id() {
                    exclude.push(pid as i32);
                }
            }
            exclude
        };
        sweep_processes(&self.sweep, &exclude).await
    }
}

/// Substitute `{file}` and `{scene}` placeholders in the renderer args.
fn build_args(renderer: &RendererConfig, file: &Path, scene: &str) -> Vec<String> {
    let file = file.display().to_string();
    renderer
        .args
        .iter()
        .map(|arg| arg.replace("{file}", &file).replace("{scene}", scene))
        .collect()
}

/// Graceful-then-forced teardown of the job in `slot`. No-op when empty.
async fn stop_job(
    slot: &mut Option<RenderJob>,
    timeout: Duration,
) -> Result<(), SupervisorError> {
    let Some(mut job) = slot.take() else {
        return Ok(());
    };
    if let Ok(Some(status)) = job.child.try_wait() {
        debug!(?status, "render process had already exited");
        return Ok(());
    }
    let Some(pid) = job.child.id() else {
        return Ok(());
    };
    let pgrp = Pid::from_raw(pid as i32);
    debug!(pid, "terminating render process group");
    // ESRCH here means the group died between try_wait and now.
    let _ = killpg(pgrp, Signal::SIGTERM);
    match tokio::time::timeout(timeout, job.child.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid, ?status, "render process exited");
            Ok(())
        }
        Ok(Err(e)) => Err(SupervisorError::Wait { source: e }),
        Err(_) => {
            warn!(pid, "render process ignored SIGTERM, killing");
            if let Err(e) = killpg(pgrp, Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    return Err(SupervisorError::Kill { source: e });
                }
            }
            job.child
                .wait()
                .await
                .map(|_| ())
                .map_err(|e| SupervisorError::Wait { source: e })
        }
    }
}

/// Terminate every process matching the stray signature, excluding the
/// given pids. Enumeration races are skipped silently.
async fn sweep_processes(sweep: &SweepConfig, exclude: &[i32]) -> usize {
    let mut system = System::new();
    system.refresh_processes();

    let mut removed = 0;
    for (pid, process) in system.processes() {
        let raw = *pid as i32;
        if exclude.contains(&raw) {
            continue;
        }
        let cmdline = process.cmd().join(" ");
        if !is_stray(sweep, process.name(), &cmdline) {
            continue;
        }
        info!(pid = raw, "removing stray GPU render process");
        terminate_stray(raw, sweep.stop_timeout).await;
        removed += 1;
    }
    if removed > 0 {
        info!(removed, "stray process sweep finished");
    }
    removed
}

/// A stray is the interpreter running the renderer in GPU mode.
fn is_stray(sweep: &SweepConfig, name: &str, cmdline: &str) -> bool {
    name == sweep.interpreter_name
        && cmdline.contains(&sweep.renderer_token)
        && cmdline.contains(&sweep.gpu_flag)
}

/// SIGTERM, poll for exit up to `timeout`, then SIGKILL. Every step is
/// best-effort: the process may be gone or inaccessible at any point.
async fn terminate_stray(pid: i32, timeout: Duration) {
    let target = Pid::from_raw(pid);
    if kill(target, Signal::SIGTERM).is_err() {
        return;
    }
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if kill(target, None).is_err() {
            return;
        }
    }
    let _ = kill(target, Signal::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Renderer that just sleeps, so jobs stay alive until stopped.
    fn sleep_renderer() -> RendererConfig {
        RendererConfig {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            ..Default::default()
        }
    }

    /// Sweep signature that matches no real process.
    fn inert_sweep() -> SweepConfig {
        SweepConfig {
            interpreter_name: "no-such-interpreter".to_string(),
            ..Default::default()
        }
    }

    fn test_supervisor() -> RenderSupervisor {
        RenderSupervisor::new(sleep_renderer(), inert_sweep())
    }

    fn alive(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[test]
    fn build_args_substitutes_placeholders() {
        let renderer = RendererConfig::default();
        let args = build_args(&renderer, Path::new("src/aula22.py"), "Alpha");
        assert_eq!(args, vec!["--renderer=cairo", "-pqp", "src/aula22.py", "Alpha"]);
    }

    #[test]
    fn build_args_without_placeholders_passes_through() {
        let renderer = sleep_renderer();
        let args = build_args(&renderer, Path::new("a.py"), "Alpha");
        assert_eq!(args, vec!["30"]);
    }

    #[test]
    fn stray_signature_requires_all_three_markers() {
        let sweep = SweepConfig::default();
        assert!(is_stray(
            &sweep,
            "python",
            "python -m manim --renderer=opengl a.py Alpha"
        ));
        // Wrong interpreter name.
        assert!(!is_stray(
            &sweep,
            "ffmpeg",
            "manim --renderer=opengl a.py Alpha"
        ));
        // Cairo renders are not strays.
        assert!(!is_stray(
            &sweep,
            "python",
            "python -m manim --renderer=cairo a.py Alpha"
        ));
        // Unrelated python process.
        assert!(!is_stray(&sweep, "python", "python -m http.server"));
    }

    #[tokio::test]
    async fn restart_launches_and_records_target() {
        let supervisor = test_supervisor();
        supervisor
            .restart(Path::new("a.py"), "Alpha")
            .await
            .unwrap();

        let (file, scene) = supervisor.current_target().await.unwrap();
        assert_eq!(file, PathBuf::from("a.py"));
        assert_eq!(scene, "Alpha");
        assert!(alive(supervisor.current_pid().await.unwrap()));

        supervisor.stop_current().await.unwrap();
    }

    #[tokio::test]
    async fn restart_stops_old_job_before_starting_new() {
        let supervisor = test_supervisor();
        supervisor
            .restart(Path::new("a.py"), "Alpha")
            .await
            .unwrap();
        let old_pid = supervisor.current_pid().await.unwrap();

        supervisor.restart(Path::new("b.py"), "Beta").await.unwrap();
        let new_pid = supervisor.current_pid().await.unwrap();

        assert_ne!(old_pid, new_pid);
        assert!(!alive(old_pid));
        assert!(alive(new_pid));
        let (file, scene) = supervisor.current_target().await.unwrap();
        assert_eq!(file, PathBuf::from("b.py"));
        assert_eq!(scene, "Beta");

        supervisor.stop_current().await.unwrap();
    }

    #[tokio::test]
    async fn restart_same_target_recreates_instance() {
        let supervisor = test_supervisor();
        supervisor
            .restart(Path::new("a.py"), "Alpha")
            .await
            .unwrap();
        let old_pid = supervisor.current_pid().await.unwrap();

        supervisor
            .restart(Path::new("a.py"), "Alpha")
            .await
            .unwrap();
        let new_pid = supervisor.current_pid().await.unwrap();

        assert_ne!(old_pid, new_pid);
        assert!(!alive(old_pid));

        supervisor.stop_current().await.unwrap();
    }

    #[tokio::test]
    async fn stop_current_with_no_job_is_noop() {
        let supervisor = test_supervisor();
        supervisor.stop_current().await.unwrap();
        assert!(supervisor.current_target().await.is_none());
    }

    #[tokio::test]
    async fn stop_current_terminates_job() {
        let supervisor = test_supervisor();
        supervisor
            .restart(Path::new("a.py"), "Alpha")
            .await
            .unwrap();
        let pid = supervisor.current_pid().await.unwrap();

        supervisor.stop_current().await.unwrap();
        assert!(!alive(pid));
        assert!(supervisor.current_target().await.is_none());
    }

    #[tokio::test]
    async fn stop_current_tolerates_job_that_already_exited() {
        let renderer = RendererConfig {
            program: "true".to_string(),
            args: vec![],
            ..Default::default()
        };
        let supervisor = RenderSupervisor::new(renderer, inert_sweep());
        supervisor
            .restart(Path::new("a.py"), "Alpha")
            .await
            .unwrap();
        // Let the process exit on its own before stopping.
        tokio::time::sleep(Duration::from_millis(200)).await;
        supervisor.stop_current().await.unwrap();
    }

    #[tokio::test]
    async fn sigterm_ignoring_job_is_killed_after_timeout() {
        // A shell that traps TERM stands in for a wedged render; only the
        // SIGKILL escalation can take it down.
        let renderer = RendererConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "trap '' TERM; while true; do sleep 1; done".to_string(),
            ],
            ..Default::default()
        };
        let supervisor = RenderSupervisor::new(renderer, inert_sweep());
        supervisor
            .restart(Path::new("a.py"), "Alpha")
            .await
            .unwrap();
        let pid = supervisor.current_pid().await.unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let start = Instant::now();
        supervisor.stop_current().await.unwrap();

        // The 2s grace period must elapse before the forced kill lands.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(!alive(pid));
        assert!(supervisor.current_target().await.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_reports_error() {
        let renderer = RendererConfig {
            program: "nonexistent-renderer-xyz".to_string(),
            ..Default::default()
        };
        let supervisor = RenderSupervisor::new(renderer, inert_sweep());
        let err = supervisor
            .restart(Path::new("a.py"), "Alpha")
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
        assert!(supervisor.current_target().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_restarts_serialize_to_one_job() {
        let supervisor = Arc::new(test_supervisor());
        let a = {
            let s = supervisor.clone();
            tokio::spawn(async move { s.restart(Path::new("a.py"), "Alpha").await })
        };
        let b = {
            let s = supervisor.clone();
            tokio::spawn(async move { s.restart(Path::new("b.py"), "Beta").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Whichever restart ran last owns the single live process.
        let pid = supervisor.current_pid().await.unwrap();
        assert!(alive(pid));
        let (_, scene) = supervisor.current_target().await.unwrap();
        assert!(scene == "Alpha" || scene == "Beta");

        supervisor.stop_current().await.unwrap();
    }

    #[tokio::test]
    async fn sweep_kills_matching_process() {
        // A sleeping child stands in for a stray GPU render: its name is
        // "sleep" and its command line carries the distinctive token.
        let mut stray = Command::new("sleep").arg("31.5").spawn().unwrap();
        let stray_pid = stray.id().unwrap() as i32;
        let sweep = SweepConfig {
            interpreter_name: "sleep".to_string(),
            renderer_token: "31.5".to_string(),
            gpu_flag: "31.5".to_string(),
            stop_timeout: Duration::from_secs(2),
        };
        // Give the process table a moment to show the child.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let removed = sweep_processes(&sweep, &[std::process::id() as i32]).await;
        assert!(removed >= 1);

        let status = tokio::time::timeout(Duration::from_secs(5), stray.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(!alive(stray_pid as u32));
    }

    #[tokio::test]
    async fn sweep_spares_excluded_pid() {
        let mut stray = Command::new("sleep").arg("32.5").spawn().unwrap();
        let stray_pid = stray.id().unwrap() as i32;
        let sweep = SweepConfig {
            interpreter_name: "sleep".to_string(),
            renderer_token: "32.5".to_string(),
            gpu_flag: "32.5".to_string(),
            stop_timeout: Duration::from_secs(2),
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        sweep_processes(&sweep, &[std::process::id() as i32, stray_pid]).await;
        assert!(alive(stray_pid as u32));

        stray.start_kill().unwrap();
        stray.wait().await.unwrap();
    }
}
