//! ufoci - camera regression testing and hardware CI
//!
//! ## Commands
//!
//! - `init`: create the home folder layout and a default config
//! - `run`: run a single test or a configured test suite
//! - `frame`: acquire one frame from the camera
//! - `script`: invoke a script by name
//! - `build`: clone, flash and test the configured repository once
//! - `serve`: start the push-triggered CI server
//! - `unlock`: remove a stale build lock
//! - `scripts`, `plugins`, `tests`: list what is registered

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use ufoci_ci::{BuildPipeline, BuildRequest, TriggerService};
use ufoci_core::hooks::HookRegistry;
use ufoci_core::{
    BuildLock, BuildLockGuard, Camera, Config, ScriptCamera, ScriptManager, TestCatalog, TestReport, TestRunner, UfoError,
};

#[derive(Parser)]
#[command(name = "ufoci")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Camera regression testing and hardware CI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Home folder (default: $HOME/.ufoci)
    #[arg(long, global = true, env = "UFOCI_PATH")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the home folder layout and write a default config
    Init,

    /// Print the effective configuration
    Config,

    /// Run tests on the camera
    Run {
        #[command(subcommand)]
        target: RunTarget,

        /// Set the camera up before and tear it down after the run
        #[arg(long)]
        setup: bool,
    },

    /// Acquire a single frame and store the raw pixels
    Frame {
        /// Output file for the little-endian 16 bit pixels
        #[arg(short, long, default_value = "frame.raw")]
        output: PathBuf,
    },

    /// Invoke a script by name
    Script {
        name: String,

        /// Arguments passed to the script
        args: Vec<String>,

        /// Use the fallback version even if a build script is active
        #[arg(long)]
        fallback: bool,
    },

    /// Build the configured repository once: clone, flash, test, archive
    Build {
        /// Repository URL (default: ci.repository_url)
        #[arg(long)]
        repository: Option<String>,

        /// Branch (default: ci.branch)
        #[arg(long)]
        branch: Option<String>,

        /// Commit to check out (default: branch tip)
        #[arg(long)]
        commit: Option<String>,
    },

    /// Start the CI trigger server
    Serve {
        /// Bind address (default: ci.hostname)
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port (default: ci.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Remove the build lock left behind by a killed build
    Unlock,

    /// List active scripts
    Scripts,

    /// List loaded plugins
    Plugins,

    /// List discovered tests
    Tests,
}

#[derive(Subcommand)]
enum RunTarget {
    /// Run a single test
    Test { name: String },

    /// Run every test of a configured suite
    Suite { name: String },
}

/// Config plus the hook registry with all plugins loaded.
struct App {
    config: Config,
    hooks: Arc<HookRegistry>,
}

impl App {
    fn load(home: PathBuf) -> Result<Self> {
        let config = Config::load(&home)?;
        let mut hooks = HookRegistry::new();
        let loaded = hooks.load_plugins(&config.plugin_path())?;
        info!(loaded, home = %config.home.display(), "Loaded plugins");
        Ok(Self {
            config,
            hooks: Arc::new(hooks),
        })
    }

    fn scripts(&self) -> Result<Arc<ScriptManager>> {
        Ok(Arc::new(ScriptManager::new(&self.config, self.hooks.clone())?))
    }

    /// Claim the camera for a manual command; fails with `LockHeld` while a
    /// build owns it.
    fn claim_hardware(&self) -> Result<BuildLockGuard> {
        Ok(BuildLock::new(self.config.lock_path()).acquire_guard()?)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    ufoci_core::telemetry::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Exit code for an error chain; ufoci errors carry their own.
fn exit_code(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<UfoError>())
        .map_or(1, |e| u8::try_from(e.exit_code()).unwrap_or(1))
}

async fn run(cli: Cli) -> Result<()> {
    let home = cli.home.unwrap_or_else(ufoci_core::home_path);

    match cli.command {
        Commands::Init => cmd_init(home),
        Commands::Unlock => cmd_unlock(home),
        Commands::Config => cmd_config(&App::load(home)?),
        Commands::Run { target, setup } => cmd_run(&App::load(home)?, target, setup).await,
        Commands::Frame { output } => cmd_frame(&App::load(home)?, &output).await,
        Commands::Script { name, args, fallback } => {
            cmd_script(&App::load(home)?, &name, &args, fallback).await
        }
        Commands::Build {
            repository,
            branch,
            commit,
        } => cmd_build(&App::load(home)?, repository, branch, commit).await,
        Commands::Serve { host, port } => cmd_serve(App::load(home)?, host, port).await,
        Commands::Scripts => cmd_scripts(&App::load(home)?),
        Commands::Plugins => cmd_plugins(&App::load(home)?),
        Commands::Tests => cmd_tests(&App::load(home)?),
    }
}

fn cmd_init(home: PathBuf) -> Result<()> {
    let config = Config::load(&home)?;
    config.init_home()?;
    println!("Initialized ufoci home at {}", config.home.display());
    println!("Place the camera scripts in {}", config.scripts_path().display());
    Ok(())
}

fn cmd_unlock(home: PathBuf) -> Result<()> {
    let config = Config::load(&home)?;
    let lock = BuildLock::new(config.lock_path());
    if lock.force_release()? {
        println!("Removed build lock {}", lock.path().display());
    } else {
        println!("No build lock present");
    }
    Ok(())
}

fn cmd_config(app: &App) -> Result<()> {
    println!("# home: {}", app.config.home.display());
    print!("{}", app.config.to_toml()?);
    Ok(())
}

async fn cmd_run(app: &App, target: RunTarget, setup: bool) -> Result<()> {
    let _lock = app.claim_hardware()?;
    let runner = TestRunner::new(app.hooks.clone(), app.scripts()?)?;
    let camera = runner.context().camera.clone();
    if setup {
        camera.set_up().await.map_err(UfoError::from)?;
    }

    let outcome = match &target {
        RunTarget::Test { name } => runner.run_test(name).await,
        RunTarget::Suite { name } => runner.run_suite(name).await,
    };

    if setup {
        if let Err(e) = camera.tear_down().await {
            error!(error = %e, "Camera tear down failed");
        }
    }

    let report = outcome?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &TestReport) {
    println!("Test run: {}", report.name);
    println!("Folder:   {}", report.folder_path.display());
    println!();
    for (name, result) in report.ordered_results() {
        let status = if result.passing() { "PASS" } else { "FAIL" };
        println!("  [{status}] {name}: {}", result.summary());
    }
    println!();
    println!(
        "{}/{} passing (success ratio {:.2})",
        report.passing_count, report.test_count, report.success_ratio
    );
}

async fn cmd_frame(app: &App, output: &Path) -> Result<()> {
    let _lock = app.claim_hardware()?;
    let camera = ScriptCamera::new(app.scripts()?);
    let frame = camera.get_frame().await.map_err(UfoError::from)?;
    let raw: Vec<u8> = frame.pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
    std::fs::write(output, raw).with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "Saved {}x{} frame to {} (mean {:.1})",
        frame.width,
        frame.height,
        output.display(),
        frame.mean()
    );
    Ok(())
}

async fn cmd_script(app: &App, name: &str, args: &[String], fallback: bool) -> Result<()> {
    let _lock = app.claim_hardware()?;
    let result = app.scripts()?.invoke(name, args, fallback).await?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if !result.success() {
        anyhow::bail!("script '{name}' exited with code {}", result.exit_code);
    }
    Ok(())
}

async fn cmd_build(
    app: &App,
    repository: Option<String>,
    branch: Option<String>,
    commit: Option<String>,
) -> Result<()> {
    let mut request = BuildRequest::from_config(&app.config);
    if let Some(repository) = repository {
        request.repository_url = repository;
    }
    if let Some(branch) = branch {
        request.branch = branch;
    }
    if let Some(commit) = commit {
        request.commit = commit;
    }
    if request.repository_url.is_empty() {
        anyhow::bail!("no repository configured; set ci.repository_url or pass --repository");
    }

    let pipeline = BuildPipeline::new(app.config.clone(), app.hooks.clone());
    let report = pipeline.run(request).await?;

    println!("Build {} of {}@{}", report.build_id, report.repository_name, report.commit);
    if let Some(sha) = &report.bitfile_sha256 {
        println!("Bitfile sha256: {sha}");
    }
    println!("Archive: {}", report.archive_path.display());
    println!();
    print_report(&report.test_report);
    Ok(())
}

async fn cmd_serve(app: App, host: Option<IpAddr>, port: Option<u16>) -> Result<()> {
    let host = match host {
        Some(host) => host,
        None => app
            .config
            .ci
            .hostname
            .parse()
            .with_context(|| format!("invalid ci.hostname '{}'", app.config.ci.hostname))?,
    };
    let addr = SocketAddr::new(host, port.unwrap_or(app.config.ci.port));
    TriggerService::new(app.config, app.hooks).serve(addr).await
}

fn cmd_scripts(app: &App) -> Result<()> {
    let scripts = app.scripts()?;
    for (name, script) in scripts.scripts() {
        let origin = if scripts.is_fallback(name) { "fallback" } else { "build" };
        println!("{name:<16} {origin:<9} {}", script.path.display());
        if !script.description.is_empty() {
            println!("{:<27}{}", "", script.description);
        }
    }
    Ok(())
}

fn cmd_plugins(app: &App) -> Result<()> {
    if app.hooks.plugins().is_empty() {
        println!("No plugins loaded from {}", app.config.plugin_path().display());
    }
    for (name, plugin) in app.hooks.plugins() {
        println!("{name:<20} entry={} {}", plugin.manifest.entry, plugin.manifest.description);
    }
    Ok(())
}

fn cmd_tests(app: &App) -> Result<()> {
    let catalog = TestCatalog::discover(&app.config, &app.hooks)?;
    for name in catalog.names() {
        println!("{name:<20} {}", catalog.description(&name).unwrap_or_default());
    }
    println!();
    for (suite, tests) in &app.config.tests.suites {
        println!("suite {suite}: {}", tests.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_suite() {
        let cli = Cli::try_parse_from(["ufoci", "--verbose", "run", "--setup", "suite", "full"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                target: RunTarget::Suite { name },
                setup,
            } => {
                assert_eq!(name, "full");
                assert!(setup);
            }
            _ => panic!("expected run suite"),
        }
    }

    #[test]
    fn test_exit_code_from_error_chain() {
        let err = anyhow::Error::from(UfoError::LockHeld {
            path: PathBuf::from("/tmp/build.locked"),
        })
        .context("build failed");
        assert_eq!(exit_code(&err), 3);
        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }

    #[test]
    fn test_init_and_unlock() {
        let home = tempfile::tempdir().unwrap();
        cmd_init(home.path().to_path_buf()).unwrap();
        assert!(home.path().join("config.toml").is_file());
        assert!(home.path().join("scripts").is_dir());

        let lock = BuildLock::new(home.path().join("build.locked"));
        lock.acquire().unwrap();
        cmd_unlock(home.path().to_path_buf()).unwrap();
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_run_mock_test() {
        let home = tempfile::tempdir().unwrap();
        let app = App::load(home.path().to_path_buf()).unwrap();
        cmd_run(&app, RunTarget::Test { name: "mock".into() }, false)
            .await
            .unwrap();
        assert!(home.path().join("archive").is_dir());
        assert!(!home.path().join("build.locked").exists());
    }

    #[tokio::test]
    async fn test_run_refused_while_build_holds_lock() {
        let home = tempfile::tempdir().unwrap();
        let app = App::load(home.path().to_path_buf()).unwrap();
        let build = BuildLock::new(app.config.lock_path());
        build.acquire().unwrap();

        let err = cmd_run(&app, RunTarget::Test { name: "mock".into() }, false)
            .await
            .unwrap_err();
        assert_eq!(exit_code(&err), 3);
        let err = cmd_script(&app, "status", &[], true).await.unwrap_err();
        assert_eq!(exit_code(&err), 3);

        assert!(build.is_locked());
        assert!(!home.path().join("archive").exists());
    }
}
