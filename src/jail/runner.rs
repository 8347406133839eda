//! Staging and execution of one jailed driver run.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::config::JailConfig;

/// Name under which the driver binary is staged into the work directory.
const DRIVER_NAME: &str = "checkrun";

/// Prevents BLAS thread over-subscription under CPU limits.
const OPENBLAS_ENV: (&str, &str) = ("OPENBLAS_NUM_THREADS", "1");

/// Errors raised while staging or launching a jailed run.
#[derive(Debug, Error)]
pub enum JailError {
    #[error("failed to stage jail work directory: {0}")]
    Stage(String),

    #[error("driver binary not found at {0}")]
    DriverMissing(PathBuf),

    #[error("failed to spawn jailed process: {0}")]
    Spawn(io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// How the jailed child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailStatus {
    Exited(i32),
    /// Killed by a signal, typically a CPU or memory rlimit.
    Signaled(i32),
    /// Killed by the parent's wall-clock bound.
    TimedOut,
}

/// Captured output of one jailed run.
#[derive(Debug, Clone)]
pub struct JailOutcome {
    pub status: JailStatus,
    pub stdout: String,
    pub stderr: String,
}

impl JailOutcome {
    pub fn success(&self) -> bool {
        self.status == JailStatus::Exited(0)
    }
}

/// Executes the in-sandbox driver for one (bundle, source, seed) triple.
#[derive(Debug, Clone)]
pub struct JailedRun {
    config: JailConfig,
    driver: PathBuf,
}

impl JailedRun {
    pub fn new(config: JailConfig, driver: PathBuf) -> Self {
        Self { config, driver }
    }

    /// Locates the `checkrun` binary next to the current executable.
    ///
    /// Test binaries live one directory deeper (`target/debug/deps`), so the
    /// parent directory is also searched.
    pub fn default_driver_path() -> Result<PathBuf, JailError> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| JailError::Stage("executable has no parent directory".to_string()))?;
        let mut candidate = dir.join(DRIVER_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if let Some(above) = dir.parent() {
            candidate = above.join(DRIVER_NAME);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(JailError::DriverMissing(candidate))
    }

    /// Runs `source` against the bundle's checker under the jail.
    ///
    /// `trusted` skips the uid drop and rlimits (used for the reference
    /// answer when the operator asserted it is trustworthy); the temp-dir
    /// staging and wall-clock bound still apply.
    pub async fn run(
        &self,
        bundle: &Path,
        checker_name: &str,
        source: &str,
        seed: u32,
        lang: &str,
        trusted: bool,
        wall_clock: Duration,
    ) -> Result<JailOutcome, JailError> {
        let (work_dir, submission_name) = self.stage(bundle, checker_name, source)?;
        let work_path = work_dir.path().to_path_buf();

        let mut command = self.build_command(&work_path, checker_name, &submission_name, seed, lang, trusted);
        debug!(
            jail = %self.config.name,
            work_dir = %work_path.display(),
            trusted,
            "Launching jailed run"
        );

        let mut child = command.spawn().map_err(JailError::Spawn)?;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_to_string(stdout_pipe));
        let stderr_task = tokio::spawn(read_to_string(stderr_pipe));

        let status = match tokio::time::timeout(wall_clock, child.wait()).await {
            Ok(waited) => {
                let exit = waited?;
                match exit.code() {
                    Some(code) => JailStatus::Exited(code),
                    None => JailStatus::Signaled(exit.signal().unwrap_or(0)),
                }
            }
            Err(_) => {
                warn!(jail = %self.config.name, ?wall_clock, "Jailed run hit the wall clock, killing");
                // The driver runs in its own process group; take the whole
                // group down so interpreter children don't linger.
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
                let _ = child.start_kill();
                let _ = child.wait().await;
                JailStatus::TimedOut
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(JailOutcome {
            status,
            stdout,
            stderr,
        })
    }

    fn build_command(
        &self,
        work_dir: &Path,
        checker_name: &str,
        submission_name: &str,
        seed: u32,
        lang: &str,
        trusted: bool,
    ) -> Command {
        let driver_args = [
            "--interpreter".to_string(),
            self.config.interpreter.display().to_string(),
            "--lang".to_string(),
            lang.to_string(),
            checker_name.to_string(),
            submission_name.to_string(),
            seed.to_string(),
        ];

        let mut command = match (&self.config.user, trusted) {
            (Some(user), false) => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-u")
                    .arg(user)
                    .arg("--")
                    .arg(format!("./{DRIVER_NAME}"))
                    .args(&driver_args);
                cmd
            }
            _ => {
                let mut cmd = Command::new(work_dir.join(DRIVER_NAME));
                cmd.args(&driver_args);
                cmd
            }
        };

        command
            .current_dir(work_dir)
            .env(OPENBLAS_ENV.0, OPENBLAS_ENV.1)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New process group, so a wall-clock kill reaches every child.
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        if !trusted {
            let limits = self.config.limits.clone();
            // Applied between fork and exec; inherited across the exec of
            // the driver and every interpreter it spawns.
            unsafe {
                command.pre_exec(move || {
                    set_rlimit(libc::RLIMIT_CPU, limits.cpu)?;
                    set_rlimit(libc::RLIMIT_AS, limits.vmem)?;
                    set_rlimit(libc::RLIMIT_FSIZE, limits.fsize)?;
                    Ok(())
                });
            }
        }

        command
    }

    /// Builds the work directory: driver binary, bundle copy, submission.
    ///
    /// Returns the directory guard and the staged submission file name,
    /// which carries the checker's extension so the interpreter treats both
    /// files the same way.
    fn stage(
        &self,
        bundle: &Path,
        checker_name: &str,
        source: &str,
    ) -> Result<(TempDir, String), JailError> {
        let work_dir = tempfile::Builder::new()
            .prefix("grade-")
            .tempdir()
            .map_err(|e| JailError::Stage(format!("could not create work dir: {e}")))?;

        // The sandbox user must traverse, read and write here.
        set_mode(work_dir.path(), 0o777)?;

        std::fs::copy(&self.driver, work_dir.path().join(DRIVER_NAME))
            .map_err(|_| JailError::DriverMissing(self.driver.clone()))?;
        set_mode(&work_dir.path().join(DRIVER_NAME), 0o755)?;

        copy_bundle(bundle, work_dir.path())?;

        let submission_name = match Path::new(checker_name).extension() {
            Some(ext) => format!("submission.{}", ext.to_string_lossy()),
            None => "submission".to_string(),
        };
        let submission_path = work_dir.path().join(&submission_name);
        std::fs::write(&submission_path, source)?;
        set_mode(&submission_path, 0o644)?;

        Ok((work_dir, submission_name))
    }
}

/// Copies the bundle tree into the work directory, world-readable.
fn copy_bundle(bundle: &Path, work_dir: &Path) -> Result<(), JailError> {
    for entry in WalkDir::new(bundle) {
        let entry = entry.map_err(|e| JailError::Stage(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(bundle)
            .map_err(|e| JailError::Stage(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = work_dir.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            set_mode(&target, 0o755)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            set_mode(&target, 0o644)?;
        }
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

async fn read_to_string<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).to_string()
}
