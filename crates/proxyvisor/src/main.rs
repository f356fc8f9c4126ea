use std::env;
use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use tokio::sync::broadcast::error::RecvError;

use proxyvisor::arch;
use proxyvisor::assets::DirAssetSource;
use proxyvisor::settings::{self, APP_NAME, ResolvedPaths, Settings};
use proxyvisor::sink::TracingSink;
use proxyvisor::store::{ConfigStore, FileConfigStore};
use proxyvisor::{Phase, ProxyService, RunState, ServiceError};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", PathsDisplay(&ctx.paths));

    async_main(ctx, cli.command)
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Run(cmd) => handle_run(&ctx, cmd).await,
        Command::Bootstrap => handle_bootstrap(&ctx).await,
        Command::Diagnose => handle_diagnose(&ctx),
        Command::Render { id } => handle_render(&ctx, &id),
        Command::List => handle_list(&ctx),
        Command::Arch => handle_arch(&ctx),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Provision, launch and supervise frp reverse-proxy executables.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start proxies and supervise them until interrupted
    Run(RunCommand),
    /// Prepare the sandboxes and report their readiness
    Bootstrap,
    /// Print a diagnostic report of the launch environment
    Diagnose,
    /// Print the configuration file that would be written for a proxy
    Render {
        /// Config id
        id: String,
    },
    /// List stored proxy configurations
    List,
    /// Show the detected architecture
    Arch,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// Config ids to start
    #[arg(value_name = "ID")]
    ids: Vec<String>,
    /// Also start every enabled config flagged autoStart
    #[arg(long)]
    auto: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    settings: Settings,
    paths: ResolvedPaths,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = settings::config_file_path(common.config.clone())?;
        let settings = Settings::load_or_init(&config_file)?;
        let paths = settings.resolve_paths()?;
        Ok(Self {
            common,
            config_file,
            settings,
            paths,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }

        // log-crate users in the library go through env_logger
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(&self.settings.logging.level),
        );
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .settings
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn store(&self) -> Result<FileConfigStore> {
        FileConfigStore::load(&self.paths.store)
    }

    fn build_service(&self) -> Result<ProxyService> {
        let config = self.settings.service_config()?;
        let store = Arc::new(self.store()?);
        let assets = Arc::new(DirAssetSource::new(&self.paths.assets_dir));
        Ok(ProxyService::new(
            config,
            store,
            assets,
            Arc::new(TracingSink),
        ))
    }

    fn print_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        );
        Ok(())
    }
}

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<()> {
    if cmd.ids.is_empty() && !cmd.auto {
        return Err(anyhow!("nothing to run: pass config ids or --auto"));
    }

    let service = ctx.build_service()?;
    let mut updates = service.subscribe();

    let mut results = Vec::new();
    if cmd.auto {
        results.extend(service.auto_start().await);
    }
    for id in cmd.ids {
        let result = service.start(&id).await;
        results.push((id, result));
    }

    for (id, result) in &results {
        match result {
            Ok(state) => print_state(ctx, state)?,
            Err(ServiceError::AlreadyRunning(_)) => {}
            Err(e) => warn!("{}: {}", id, e),
        }
    }

    if service.list_running().is_empty() {
        let failed = results
            .iter()
            .filter(|(_, r)| !matches!(r, Ok(state) if state.phase != Phase::Error))
            .count();
        return if failed > 0 {
            Err(anyhow!("{failed} of {} proxies failed to start", results.len()))
        } else {
            Ok(())
        };
    }

    info!(
        "supervising {} processes, press Ctrl-C to stop",
        service.list_running().len()
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            update = updates.recv() => match update {
                Ok(state) => {
                    if matches!(state.phase, Phase::Stopped | Phase::Error) {
                        print_state(ctx, &state)?;
                    }
                    if service.list_running().is_empty() {
                        info!("all processes have exited");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("missed {} status updates", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    for (id, result) in service.stop_all().await {
        match result {
            Ok(state) => print_state(ctx, &state)?,
            Err(e) => warn!("{}: {}", id, e),
        }
    }
    Ok(())
}

fn print_state(ctx: &RuntimeContext, state: &RunState) -> Result<()> {
    if ctx.common.json {
        return ctx.print_json(state);
    }
    println!("{}", StateLine(state));
    Ok(())
}

struct StateLine<'a>(&'a RunState);

impl fmt::Display for StateLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0;
        write!(f, "{}: {}", state.config_id, state.phase)?;
        if let Some(pid) = state.pid {
            write!(f, " pid={pid}")?;
        }
        if let Some(strategy) = state.strategy {
            write!(f, " via={strategy}")?;
        }
        if let Some(code) = state.exit_code {
            write!(f, " exit={code}")?;
        }
        if let Some(ref message) = state.error_message {
            write!(f, " ({message})")?;
        }
        Ok(())
    }
}

async fn handle_bootstrap(ctx: &RuntimeContext) -> Result<()> {
    let service = ctx.build_service()?;
    let (full, root) = service.bootstrap().await;
    if ctx.common.json {
        return ctx.print_json(&[full, root]);
    }
    for desc in [full, root] {
        match desc.reason {
            None => println!("{}: ready ({})", desc.kind, desc.root.display()),
            Some(reason) => println!("{}: not ready ({})", desc.kind, reason),
        }
    }
    Ok(())
}

fn handle_diagnose(ctx: &RuntimeContext) -> Result<()> {
    let service = ctx.build_service()?;
    let report = service.diagnose();
    if ctx.common.json {
        return ctx.print_json(&report);
    }
    print!("{report}");
    Ok(())
}

fn handle_render(ctx: &RuntimeContext, id: &str) -> Result<()> {
    let service = ctx.build_service()?;
    print!("{}", service.render_config(id)?);
    Ok(())
}

fn handle_list(ctx: &RuntimeContext) -> Result<()> {
    let store = ctx.store()?;
    let configs = store.list();
    if ctx.common.json {
        return ctx.print_json(&configs);
    }
    if configs.is_empty() {
        println!("no configs in {}", store.path().display());
        return Ok(());
    }
    for config in configs {
        println!(
            "{:<20} {:<6} {:<24} {}{}",
            config.id,
            config.role.to_string(),
            config.display_name(),
            if config.enabled { "enabled" } else { "disabled" },
            if config.auto_start { ", auto-start" } else { "" }
        );
    }
    Ok(())
}

fn handle_arch(ctx: &RuntimeContext) -> Result<()> {
    let abis = if ctx.settings.runtime.abis.is_empty() {
        arch::host_abis()
    } else {
        ctx.settings.runtime.abis.clone()
    };
    let resolution = arch::resolve(&abis);
    if ctx.common.json {
        return ctx.print_json(&serde_json::json!({
            "abis": abis,
            "arch": resolution.arch,
            "abi": resolution.arch.abi(),
            "matched": resolution.matched,
        }));
    }
    println!("ABIs: {}", abis.join(", "));
    println!(
        "arch: {} ({}){}",
        resolution.arch,
        resolution.arch.abi(),
        if resolution.matched { "" } else { " [default]" }
    );
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                ctx.print_json(&ctx.settings)
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.settings).context("serializing config to TOML")?
                );
                Ok(())
            }
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

struct PathsDisplay<'a>(&'a ResolvedPaths);

impl fmt::Display for PathsDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exec: {}, assets: {}, configs: {}, store: {}",
            self.0.exec_dir.display(),
            self.0.assets_dir.display(),
            self.0.config_dir.display(),
            self.0.store.display()
        )
    }
}
