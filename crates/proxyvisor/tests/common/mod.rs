//! Test utilities and common setup.
#![allow(dead_code)]

use async_trait::async_trait;
use proxyvisor::arch::Arch;
use proxyvisor::assets::DirAssetSource;
use proxyvisor::launch::{LaunchPlan, LaunchStrategy, Spawner};
use proxyvisor::provision::ELF_MAGIC;
use proxyvisor::sink::MemorySink;
use proxyvisor::store::MemoryConfigStore;
use proxyvisor::{Phase, ProxyConfig, ProxyService, RunState, ServiceConfig};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

/// Architecture every fixture pretends to run on.
pub const TEST_ARCH: Arch = Arch::Arm64;

/// A long-running process that reports a successful start.
pub const HEALTHY: &str = "echo 'start frpc success'; exec sleep 30";

/// What the test spawner does for one strategy.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Refuse to spawn, like a permission-denied exec.
    Fail,
    /// Run the script with `sh -c`.
    Script(String),
}

/// Spawns `sh -c <script>` in place of the planned command and records every
/// plan it is handed.
#[derive(Debug)]
pub struct ScriptSpawner {
    behaviors: HashMap<LaunchStrategy, Behavior>,
    plans: Mutex<Vec<LaunchPlan>>,
}

impl ScriptSpawner {
    /// Every strategy runs `script`.
    pub fn always(script: &str) -> Arc<Self> {
        Self::with(
            LaunchStrategy::ALL
                .into_iter()
                .map(|s| (s, Behavior::Script(script.to_string())))
                .collect(),
        )
    }

    /// Every strategy fails to spawn.
    pub fn failing() -> Arc<Self> {
        Self::with(
            LaunchStrategy::ALL
                .into_iter()
                .map(|s| (s, Behavior::Fail))
                .collect(),
        )
    }

    pub fn with(behaviors: Vec<(LaunchStrategy, Behavior)>) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors.into_iter().collect(),
            plans: Mutex::new(Vec::new()),
        })
    }

    /// Strategies attempted so far, in order.
    pub fn attempted(&self) -> Vec<LaunchStrategy> {
        self.plans
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.strategy)
            .collect()
    }

    pub fn plans(&self) -> Vec<LaunchPlan> {
        self.plans.lock().unwrap().clone()
    }
}

#[async_trait]
impl Spawner for ScriptSpawner {
    async fn spawn(&self, plan: &LaunchPlan) -> io::Result<Child> {
        self.plans.lock().unwrap().push(plan.clone());
        match self.behaviors.get(&plan.strategy) {
            Some(Behavior::Script(script)) => Command::new("sh")
                .arg("-c")
                .arg(script)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(0)
                .kill_on_drop(true)
                .spawn(),
            Some(Behavior::Fail) | None => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "Permission denied (os error 13)",
            )),
        }
    }
}

/// Knobs for [`TestEnv::build`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Bundle the userland assets and enable the full environment.
    pub full_environment: bool,
    pub max_processes: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            full_environment: false,
            max_processes: 16,
        }
    }
}

/// A service wired to a temporary directory, an in-memory store and sink, and a
/// scripted spawner.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub service: ProxyService,
    pub sink: Arc<MemorySink>,
    pub spawner: Arc<ScriptSpawner>,
}

impl TestEnv {
    pub fn new(configs: Vec<ProxyConfig>, spawner: Arc<ScriptSpawner>) -> Self {
        Self::build(configs, spawner, Options::default())
    }

    pub fn build(configs: Vec<ProxyConfig>, spawner: Arc<ScriptSpawner>, opts: Options) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let assets_dir = dir.path().join("assets");
        bundle_proxies(&assets_dir);
        if opts.full_environment {
            bundle_userland(&assets_dir);
        }

        let mut config = ServiceConfig::new(dir.path().join("exec"), dir.path().join("configs"));
        config.abis = vec![TEST_ARCH.abi().to_string()];
        config.system_shell = PathBuf::from("/bin/sh");
        config.full_environment = opts.full_environment;
        config.root_emulation = false;
        config.min_binary_size = 16;
        config.min_emulator_size = 16;
        config.stop_timeout = Duration::from_secs(2);
        config.max_processes = opts.max_processes;

        let sink = Arc::new(MemorySink::new());
        let service = ProxyService::new(
            config,
            Arc::new(MemoryConfigStore::new(configs)),
            Arc::new(DirAssetSource::new(&assets_dir)),
            sink.clone(),
        )
        .with_spawner(spawner.clone());

        Self {
            dir,
            service,
            sink,
            spawner,
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dir.path().join("configs")
    }

    pub fn exec_dir(&self) -> PathBuf {
        self.dir.path().join("exec")
    }
}

pub fn fake_elf(size: usize) -> Vec<u8> {
    let mut bytes = ELF_MAGIC.to_vec();
    bytes.resize(size, 0);
    bytes
}

fn write_asset(path: &Path, bytes: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

fn bundle_proxies(assets: &Path) {
    for name in ["frpc", "frps"] {
        write_asset(
            &assets.join("frp").join(TEST_ARCH.abi()).join(name),
            &fake_elf(256),
        );
    }
}

fn bundle_userland(assets: &Path) {
    let bin = assets.join("termux").join(TEST_ARCH.abi()).join("bin");
    for tool in ["bash", "sh"] {
        write_asset(&bin.join(tool), &fake_elf(64));
    }
    write_asset(&assets.join("termux/startup.sh"), b"#!/bin/sh\nexit 0\n");
}

/// Client config pointing at `example.com:7000`.
pub fn client(id: &str, local_port: u16) -> ProxyConfig {
    ProxyConfig::client(id, "example.com", 7000, local_port)
}

/// Wait until `rx` delivers a state for `config_id` matching `done`.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<RunState>,
    config_id: &str,
    done: impl Fn(&RunState) -> bool,
) -> RunState {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(state) if state.config_id == config_id && done(&state) => return state,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("status channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for state")
}

/// Wait until `config_id` leaves the running phase.
pub async fn wait_for_exit(rx: &mut broadcast::Receiver<RunState>, config_id: &str) -> RunState {
    wait_for(rx, config_id, |s| {
        matches!(s.phase, Phase::Stopped | Phase::Error)
    })
    .await
}
