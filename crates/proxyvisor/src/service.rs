//! The proxy service: the one entry point callers use.
//!
//! `start` walks a configuration through reservation, sandbox bootstrap,
//! provisioning, config synthesis, strategy selection and supervision. Every
//! failure after the reservation ends in an ERROR [`RunState`] rather than an
//! `Err`, because the caller observes outcomes through state.

use futures::future::join_all;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore, broadcast};

use crate::arch::{self, Arch, Resolution};
use crate::assets::AssetSource;
use crate::diagnose::{self, DiagnosticReport};
use crate::error::ServiceError;
use crate::launch::{CommandSpawner, LaunchSelector, LaunchTarget, Launched, Spawner};
use crate::models::{ProxyConfig, Role, RunState};
use crate::process::{
    DEFAULT_MAX_OUTPUT_LINES, DEFAULT_STOP_TIMEOUT, OutputClassifier, ProcessSupervisor,
};
use crate::provision::{BinaryProvisioner, DEFAULT_MIN_BINARY_SIZE, DEFAULT_MIN_EMULATOR_SIZE};
use crate::registry::{Registry, Reservation};
use crate::sandbox::{SandboxBootstrapper, SandboxDescriptor};
use crate::sink::{LogLevel, LogSink};
use crate::store::ConfigStore;
use crate::synth;

const SERVICE_TAG: &str = "service";
const PROXY_CATEGORY: &str = "frp";

/// Runtime parameters of a [`ProxyService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub exec_dir: PathBuf,
    pub config_dir: PathBuf,
    /// Host ABI override; empty means detect.
    pub abis: Vec<String>,
    pub system_shell: PathBuf,
    pub full_environment: bool,
    pub root_emulation: bool,
    pub min_binary_size: u64,
    pub min_emulator_size: u64,
    pub stop_timeout: Duration,
    pub max_output_lines: usize,
    /// Concurrent process limit; zero is raised to one.
    pub max_processes: usize,
    pub classifier: OutputClassifier,
}

impl ServiceConfig {
    /// Defaults for everything but the two directories.
    pub fn new(exec_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            exec_dir: exec_dir.into(),
            config_dir: config_dir.into(),
            abis: Vec::new(),
            system_shell: PathBuf::from("/system/bin/sh"),
            full_environment: true,
            root_emulation: true,
            min_binary_size: DEFAULT_MIN_BINARY_SIZE,
            min_emulator_size: DEFAULT_MIN_EMULATOR_SIZE,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            max_processes: 16,
            classifier: OutputClassifier::default(),
        }
    }
}

/// Launches and supervises proxy processes for stored configurations.
pub struct ProxyService {
    config: ServiceConfig,
    abis: Vec<String>,
    resolution: Resolution,
    store: Arc<dyn ConfigStore>,
    assets: Arc<dyn AssetSource>,
    sink: Arc<dyn LogSink>,
    registry: Arc<Registry>,
    binaries: BinaryProvisioner,
    sandboxes: SandboxBootstrapper,
    selector: LaunchSelector,
    supervisor: ProcessSupervisor,
    bootstrapped: OnceCell<()>,
    slots: Arc<Semaphore>,
}

impl ProxyService {
    pub fn new(
        mut config: ServiceConfig,
        store: Arc<dyn ConfigStore>,
        assets: Arc<dyn AssetSource>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        config.max_processes = config.max_processes.max(1);
        let abis = if config.abis.is_empty() {
            arch::host_abis()
        } else {
            config.abis.clone()
        };
        let resolution = arch::resolve(&abis);
        if !resolution.matched {
            sink.record(
                LogLevel::Warn,
                SERVICE_TAG,
                &format!(
                    "unrecognized ABIs [{}], using {}",
                    abis.join(", "),
                    resolution.arch
                ),
                None,
            );
        }

        let binaries = BinaryProvisioner::new(assets.clone(), PROXY_CATEGORY, &config.exec_dir)
            .with_min_size(config.min_binary_size);
        let sandboxes = SandboxBootstrapper::new(assets.clone(), &config.exec_dir)
            .with_enabled(config.full_environment, config.root_emulation)
            .with_emulator_min_size(config.min_emulator_size);
        let selector = LaunchSelector::new(
            sandboxes.clone(),
            config.system_shell.clone(),
            Arc::new(CommandSpawner),
        );
        let registry = Arc::new(Registry::new());
        let supervisor = ProcessSupervisor::new(registry.clone(), sink.clone())
            .with_classifier(config.classifier.clone())
            .with_max_output_lines(config.max_output_lines)
            .with_stop_timeout(config.stop_timeout);
        let slots = Arc::new(Semaphore::new(config.max_processes));

        Self {
            config,
            abis,
            resolution,
            store,
            assets,
            sink,
            registry,
            binaries,
            sandboxes,
            selector,
            supervisor,
            bootstrapped: OnceCell::new(),
            slots,
        }
    }

    /// Replace the process spawner.
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.selector = LaunchSelector::new(
            self.sandboxes.clone(),
            self.config.system_shell.clone(),
            spawner,
        );
        self
    }

    pub fn arch(&self) -> Arch {
        self.resolution.arch
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Start the process for `config_id`.
    ///
    /// Unknown ids and ids that already own a process are rejected without a
    /// state change. Everything else returns the resulting state: RUNNING once a
    /// strategy has launched, ERROR with a message otherwise.
    pub async fn start(&self, config_id: &str) -> Result<RunState, ServiceError> {
        let config = self
            .store
            .get(config_id)
            .ok_or_else(|| ServiceError::UnknownConfig(config_id.to_string()))?;

        let reservation = match self.registry.reserve(config_id) {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!("{}", e);
                self.sink
                    .record(LogLevel::Warn, SERVICE_TAG, &e.to_string(), Some(config_id));
                return Err(e);
            }
        };

        self.registry.set_status(RunState::starting(config_id));
        self.sink.record(
            LogLevel::Info,
            SERVICE_TAG,
            &format!("starting {} ({})", config.display_name(), config.role),
            Some(config_id),
        );

        Ok(self.launch(&config, reservation).await)
    }

    /// Launch `config` under `reservation`. A failure is recorded as ERROR
    /// while the claim is still held.
    async fn launch(&self, config: &ProxyConfig, reservation: Reservation) -> RunState {
        match self.spawn_process(config).await {
            Ok((launched, permit)) => self.supervisor.supervise(
                reservation,
                launched,
                config.role.executable(),
                Some(permit),
            ),
            Err(message) => {
                warn!("{} failed to start: {}", config.id, message);
                self.sink
                    .record(LogLevel::Error, SERVICE_TAG, &message, Some(&config.id));
                let state = RunState::error(&config.id, message);
                reservation.fail(state.clone());
                state
            }
        }
    }

    async fn spawn_process(
        &self,
        config: &ProxyConfig,
    ) -> Result<(Launched, OwnedSemaphorePermit), String> {
        config
            .validate()
            .map_err(|e| format!("invalid configuration: {e}"))?;

        self.ensure_bootstrapped().await;

        let permit = self.slots.clone().try_acquire_owned().map_err(|_| {
            format!(
                "process limit of {} reached",
                self.config.max_processes
            )
        })?;

        let executable = config.role.executable();
        let binaries = self.binaries.clone();
        let arch = self.arch();
        let binary = tokio::task::spawn_blocking(move || binaries.ensure(executable, arch))
            .await
            .map_err(|e| format!("provisioning task failed: {e}"))?
            .map_err(|e| format!("provisioning {executable} failed: {e}"))?;

        let config_file = self.write_config_file(config).await?;

        let target = LaunchTarget {
            binary,
            config_file,
            exec_dir: self.config.exec_dir.clone(),
        };
        let launched = self
            .selector
            .launch(&target)
            .await
            .map_err(|e| e.to_string())?;
        Ok((launched, permit))
    }

    async fn write_config_file(&self, config: &ProxyConfig) -> Result<PathBuf, String> {
        let dir = &self.config.config_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| format!("creating {}: {e}", dir.display()))?;
        let path = dir.join(format!("{}.toml", config.id));
        tokio::fs::write(&path, synth::synthesize(config))
            .await
            .map_err(|e| format!("writing {}: {e}", path.display()))?;
        Ok(path)
    }

    /// Stop the process for `config_id` and return its final state.
    pub async fn stop(&self, config_id: &str) -> Result<RunState, ServiceError> {
        match self.supervisor.stop(config_id).await {
            Ok(state) => {
                self.sink
                    .record(LogLevel::Info, SERVICE_TAG, "stopped", Some(config_id));
                Ok(state)
            }
            Err(e) => {
                warn!("{}", e);
                self.sink
                    .record(LogLevel::Warn, SERVICE_TAG, &e.to_string(), Some(config_id));
                Err(e)
            }
        }
    }

    /// Stop every running process concurrently.
    pub async fn stop_all(&self) -> Vec<(String, Result<RunState, ServiceError>)> {
        let ids = self.registry.running_ids();
        if ids.is_empty() {
            return Vec::new();
        }
        info!("stopping {} running processes", ids.len());
        let results = join_all(ids.iter().map(|id| self.stop(id))).await;
        ids.into_iter().zip(results).collect()
    }

    /// Last known state of `config_id`.
    pub fn status(&self, config_id: &str) -> RunState {
        self.registry.status(config_id)
    }

    pub fn list_running(&self) -> Vec<RunState> {
        self.registry.list_running()
    }

    /// Every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunState> {
        self.registry.subscribe()
    }

    /// Prepare both sandboxes now and report their readiness.
    pub async fn bootstrap(&self) -> (SandboxDescriptor, SandboxDescriptor) {
        self.run_bootstrap().await;
        let _ = self.bootstrapped.set(());
        (
            self.sandboxes.full_environment(),
            self.sandboxes.root_emulation(),
        )
    }

    async fn ensure_bootstrapped(&self) {
        self.bootstrapped
            .get_or_init(|| self.run_bootstrap())
            .await;
    }

    async fn run_bootstrap(&self) {
        let sandboxes = self.sandboxes.clone();
        let arch = self.arch();
        if let Err(e) = tokio::task::spawn_blocking(move || sandboxes.prepare_all(arch)).await {
            warn!("sandbox bootstrap task failed: {}", e);
        }
    }

    /// Start every enabled configuration flagged for automatic start.
    pub async fn auto_start(&self) -> Vec<(String, Result<RunState, ServiceError>)> {
        let mut results = Vec::new();
        for config in self
            .store
            .list()
            .into_iter()
            .filter(|c| c.enabled && c.auto_start)
        {
            info!("auto-starting {}", config.id);
            let result = self.start(&config.id).await;
            results.push((config.id, result));
        }
        results
    }

    /// Configuration text that `start` would write for `config_id`.
    pub fn render_config(&self, config_id: &str) -> Result<String, ServiceError> {
        self.store
            .get(config_id)
            .map(|c| synth::synthesize(&c))
            .ok_or_else(|| ServiceError::UnknownConfig(config_id.to_string()))
    }

    /// Read-only report of everything that influences launching.
    pub fn diagnose(&self) -> DiagnosticReport {
        let mut binaries = Vec::new();
        let mut recommended = Vec::new();
        for role in [Role::Client, Role::Server] {
            let status = self.binaries.inspect(role.executable());
            let target = LaunchTarget {
                binary: status.path.clone(),
                config_file: self.config.config_dir.join("diagnose.toml"),
                exec_dir: self.config.exec_dir.clone(),
            };
            recommended.push((role, self.selector.recommended(&target)));
            binaries.push(status);
        }

        diagnose::collect(diagnose::Inputs {
            abis: &self.abis,
            resolution: self.resolution,
            assets: self.assets.as_ref(),
            sandboxes: &self.sandboxes,
            binaries,
            running: self.registry.list_running(),
            recommended,
        })
    }
}
