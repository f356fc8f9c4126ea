//! Launch strategy selection.
//!
//! A proxy binary can be started three ways, tried in a fixed order:
//!
//! 1. `FullEnvironment`: through the bundled shell inside the userland tree.
//! 2. `RootEmulation`: under `proot`.
//! 3. `Direct`: plain exec.
//!
//! The selector moves to the next strategy when the current one's sandbox is not
//! ready or the OS refuses to spawn. The first process that starts wins; later
//! strategies are never tried once one has succeeded.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};

use crate::error::{AttemptFailure, LaunchError};
use crate::provision::BinaryStatus;
use crate::sandbox::SandboxBootstrapper;

/// How a supervised process was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchStrategy {
    FullEnvironment,
    RootEmulation,
    Direct,
}

impl LaunchStrategy {
    /// Attempt order.
    pub const ALL: [LaunchStrategy; 3] = [
        LaunchStrategy::FullEnvironment,
        LaunchStrategy::RootEmulation,
        LaunchStrategy::Direct,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LaunchStrategy::FullEnvironment => "full-environment",
            LaunchStrategy::RootEmulation => "root-emulation",
            LaunchStrategy::Direct => "direct",
        }
    }
}

impl fmt::Display for LaunchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command ready to be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub strategy: LaunchStrategy,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Command run to completion before the main process. A non-zero exit is only
    /// a warning.
    pub pre_launch: Option<(PathBuf, Vec<String>)>,
}

impl LaunchPlan {
    /// Human-readable command line, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().map(|a| shell_escape(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    /// Provisioned proxy executable.
    pub binary: PathBuf,
    /// Synthesized configuration file.
    pub config_file: PathBuf,
    /// Working directory for every strategy.
    pub exec_dir: PathBuf,
}

impl LaunchTarget {
    fn config_dir(&self) -> &Path {
        self.config_file.parent().unwrap_or(&self.exec_dir)
    }
}

/// Starts processes for a plan.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Run the plan's pre-launch step (if any) and spawn the main process with
    /// stdout and stderr piped.
    async fn spawn(&self, plan: &LaunchPlan) -> io::Result<Child>;
}

/// Spawns real OS processes.
///
/// Each child leads its own process group so termination can reach everything it
/// forks (the shell wrapper, proot's tracee).
#[derive(Debug, Clone, Default)]
pub struct CommandSpawner;

#[async_trait]
impl Spawner for CommandSpawner {
    async fn spawn(&self, plan: &LaunchPlan) -> io::Result<Child> {
        if let Some((program, args)) = &plan.pre_launch {
            run_pre_launch(program, args, &plan.cwd, &plan.env).await;
        }

        debug!("spawning [{}] {}", plan.strategy, plan.command_line());
        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(&plan.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        for (key, value) in &plan.env {
            cmd.env(key, value);
        }
        cmd.spawn()
    }
}

async fn run_pre_launch(program: &Path, args: &[String], cwd: &Path, env: &[(String, String)]) {
    debug!("pre-launch: {} {}", program.display(), args.join(" "));
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd).stdin(Stdio::null());
    for (key, value) in env {
        cmd.env(key, value);
    }
    match cmd.output().await {
        Ok(output) if output.status.success() => {
            debug!("pre-launch {} finished", program.display());
        }
        Ok(output) => warn!(
            "pre-launch {} exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => warn!("pre-launch {} could not run: {}", program.display(), e),
    }
}

/// A successfully started process and how it was started.
#[derive(Debug)]
pub struct Launched {
    pub child: Child,
    pub strategy: LaunchStrategy,
    pub plan: LaunchPlan,
}

/// Walks the strategy chain for one target.
#[derive(Clone)]
pub struct LaunchSelector {
    sandboxes: SandboxBootstrapper,
    system_shell: PathBuf,
    spawner: Arc<dyn Spawner>,
}

impl LaunchSelector {
    pub fn new(
        sandboxes: SandboxBootstrapper,
        system_shell: impl Into<PathBuf>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            sandboxes,
            system_shell: system_shell.into(),
            spawner,
        }
    }

    /// Check readiness for one strategy and build its plan.
    pub fn plan(
        &self,
        strategy: LaunchStrategy,
        target: &LaunchTarget,
    ) -> Result<LaunchPlan, AttemptFailure> {
        let binary = BinaryStatus::examine(&target.binary);
        if !binary.runnable() {
            return Err(AttemptFailure::SandboxUnavailable(format!(
                "{} is {}",
                target.binary.display(),
                if binary.exists {
                    "not executable"
                } else {
                    "missing"
                }
            )));
        }

        match strategy {
            LaunchStrategy::FullEnvironment => {
                let desc = self.sandboxes.full_environment();
                if !desc.ready {
                    return Err(AttemptFailure::SandboxUnavailable(
                        desc.reason.unwrap_or_else(|| "not ready".to_string()),
                    ));
                }
                Ok(full_environment_plan(
                    &self.sandboxes,
                    &self.system_shell,
                    target,
                ))
            }
            LaunchStrategy::RootEmulation => {
                let desc = self.sandboxes.root_emulation();
                if !desc.ready {
                    return Err(AttemptFailure::SandboxUnavailable(
                        desc.reason.unwrap_or_else(|| "not ready".to_string()),
                    ));
                }
                Ok(root_emulation_plan(&self.sandboxes.emulator_path(), target))
            }
            LaunchStrategy::Direct => Ok(direct_plan(target)),
        }
    }

    /// The first strategy that would be attempted, without spawning anything.
    pub fn recommended(&self, target: &LaunchTarget) -> Option<LaunchStrategy> {
        LaunchStrategy::ALL
            .into_iter()
            .find(|s| self.plan(*s, target).is_ok())
    }

    /// Try each strategy in order until one spawns.
    pub async fn launch(&self, target: &LaunchTarget) -> Result<Launched, LaunchError> {
        let mut attempts = Vec::new();

        for strategy in LaunchStrategy::ALL {
            let plan = match self.plan(strategy, target) {
                Ok(plan) => plan,
                Err(failure) => {
                    info!("{} skipped: {}", strategy, failure);
                    attempts.push((strategy, failure));
                    continue;
                }
            };

            match self.spawner.spawn(&plan).await {
                Ok(child) => {
                    info!(
                        "launched {} via {} (pid {:?})",
                        target.binary.display(),
                        strategy,
                        child.id()
                    );
                    return Ok(Launched {
                        child,
                        strategy,
                        plan,
                    });
                }
                Err(e) => {
                    warn!("{} spawn failed: {}", strategy, e);
                    attempts.push((strategy, AttemptFailure::SpawnFailed(e.to_string())));
                }
            }
        }

        Err(LaunchError { attempts })
    }
}

/// `bash -c "source <env> && cd <exec> && exec <bin> -c <cfg>"` inside the userland tree.
pub fn full_environment_plan(
    sandboxes: &SandboxBootstrapper,
    system_shell: &Path,
    target: &LaunchTarget,
) -> LaunchPlan {
    let root = sandboxes.rootfs();
    let script = format!(
        "source {} && cd {} && exec {} -c {}",
        shell_escape(&sandboxes.env_file().to_string_lossy()),
        shell_escape(&target.exec_dir.to_string_lossy()),
        shell_escape(&target.binary.to_string_lossy()),
        shell_escape(&target.config_file.to_string_lossy()),
    );
    let rooted = |sub: &str| root.join(sub).to_string_lossy().into_owned();

    LaunchPlan {
        strategy: LaunchStrategy::FullEnvironment,
        program: sandboxes.interpreter(),
        args: vec!["-c".to_string(), script],
        cwd: target.exec_dir.clone(),
        env: vec![
            ("TERMUX_PREFIX".into(), root.to_string_lossy().into_owned()),
            ("TERMUX_HOME".into(), rooted("home")),
            (
                "PATH".into(),
                format!("{}:/system/bin:/system/xbin", rooted("bin")),
            ),
            (
                "LD_LIBRARY_PATH".into(),
                format!("{}:/system/lib:/system/lib64", rooted("lib")),
            ),
            ("HOME".into(), rooted("home")),
            ("TMPDIR".into(), rooted("tmp")),
            (
                "SHELL".into(),
                sandboxes.interpreter().to_string_lossy().into_owned(),
            ),
        ],
        pre_launch: Some((
            system_shell.to_path_buf(),
            vec![sandboxes.startup_script().to_string_lossy().into_owned()],
        )),
    }
}

/// `proot -r / -b <exec> -b <cfgdir> -w <exec> <bin> -c <cfg>`.
pub fn root_emulation_plan(emulator: &Path, target: &LaunchTarget) -> LaunchPlan {
    let exec = target.exec_dir.to_string_lossy().into_owned();
    LaunchPlan {
        strategy: LaunchStrategy::RootEmulation,
        program: emulator.to_path_buf(),
        args: vec![
            "-r".into(),
            "/".into(),
            "-b".into(),
            exec.clone(),
            "-b".into(),
            target.config_dir().to_string_lossy().into_owned(),
            "-w".into(),
            exec,
            target.binary.to_string_lossy().into_owned(),
            "-c".into(),
            target.config_file.to_string_lossy().into_owned(),
        ],
        cwd: target.exec_dir.clone(),
        env: Vec::new(),
        pre_launch: None,
    }
}

/// `<bin> -c <cfg>`.
pub fn direct_plan(target: &LaunchTarget) -> LaunchPlan {
    LaunchPlan {
        strategy: LaunchStrategy::Direct,
        program: target.binary.clone(),
        args: vec![
            "-c".into(),
            target.config_file.to_string_lossy().into_owned(),
        ],
        cwd: target.exec_dir.clone(),
        env: Vec::new(),
        pre_launch: None,
    }
}

/// Escape a string for safe use in a shell command.
fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':'))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
