//! Installing the worker package into its virtual environment.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pep440_rs::{Version, VersionSpecifiers};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::PackageError;

/// Default package the worker runs from.
pub const DEFAULT_PACKAGE: &str = "fleet-worker-runtime";

/// Default extras requested with the package.
pub const DEFAULT_EXTRAS: &str = "worker";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const ENV_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const PIP_UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Package spec
// =============================================================================

/// Requested version of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReq {
    /// `==<version>`
    Exact(String),
    /// A constraint that already carries its operator, e.g. `>=1.2,<2`.
    Range(String),
    Latest,
}

impl VersionReq {
    /// Interprets a desired version: a leading comparison operator makes it a
    /// range, anything else is an exact version.
    pub fn parse(version: &str) -> Self {
        let version = version.trim();
        if version.is_empty() || version.eq_ignore_ascii_case("latest") {
            return VersionReq::Latest;
        }
        const OPERATORS: [&str; 7] = ["==", ">=", "<=", "~=", "!=", ">", "<"];
        if OPERATORS.iter().any(|op| version.starts_with(op)) {
            VersionReq::Range(version.to_string())
        } else {
            VersionReq::Exact(version.to_string())
        }
    }

    pub fn exact(&self) -> Option<&str> {
        match self {
            VersionReq::Exact(version) => Some(version),
            _ => None,
        }
    }
}

/// Installable package reference: `name[extras]==version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    pub extras: Option<String>,
    pub version: VersionReq,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>, extras: Option<String>, version: VersionReq) -> Self {
        Self {
            name: name.into(),
            extras: extras.filter(|e| !e.is_empty()),
            version,
        }
    }

    pub fn render(&self) -> String {
        let mut spec = self.name.clone();
        if let Some(extras) = &self.extras {
            spec.push('[');
            spec.push_str(extras);
            spec.push(']');
        }
        match &self.version {
            VersionReq::Exact(version) => {
                spec.push_str("==");
                spec.push_str(version);
            }
            VersionReq::Range(range) => spec.push_str(range),
            VersionReq::Latest => {}
        }
        spec
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

// =============================================================================
// Package manager
// =============================================================================

#[async_trait]
pub trait PackageManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Installs or upgrades `spec` into the environment at `env`.
    async fn install(&self, env: &Path, spec: &PackageSpec, force: bool) -> Result<(), PackageError>;

    /// Version of `package` installed in `env`, `None` when absent.
    async fn installed_version(&self, env: &Path, package: &str) -> Result<Option<String>, PackageError>;

    /// Creates a virtual environment at `env` with `python`.
    async fn create_env(&self, python: &str, env: &Path) -> Result<(), PackageError> {
        let mut command = Command::new(python);
        command.args(["-m", "venv"]).arg(env);
        run_step("create virtual environment", command, ENV_TIMEOUT).await
    }

    /// Readies a fresh or existing environment for installs.
    async fn prepare_env(&self, _env: &Path) -> Result<(), PackageError> {
        Ok(())
    }
}

/// `uv` when it is on `PATH`, otherwise the environment's own `pip`.
pub fn detect() -> Box<dyn PackageManager> {
    match which::which("uv") {
        Ok(uv) => Box::new(UvPackageManager { uv }),
        Err(_) => Box::new(PipPackageManager),
    }
}

fn pip_path(env: &Path) -> PathBuf {
    if cfg!(windows) {
        env.join("Scripts").join("pip.exe")
    } else {
        env.join("bin").join("pip")
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipPackageManager;

#[async_trait]
impl PackageManager for PipPackageManager {
    fn name(&self) -> &'static str {
        "pip"
    }

    async fn install(&self, env: &Path, spec: &PackageSpec, force: bool) -> Result<(), PackageError> {
        let pip = pip_path(env);
        if !pip.is_file() {
            return Err(PackageError::ManagerMissing(pip));
        }
        let mut command = Command::new(&pip);
        command.args(["install", "--upgrade", "--quiet"]);
        if force {
            command.arg("--force-reinstall");
        }
        command.arg(spec.render());
        run_install(command, spec).await
    }

    async fn installed_version(&self, env: &Path, package: &str) -> Result<Option<String>, PackageError> {
        let pip = pip_path(env);
        if !pip.is_file() {
            return Err(PackageError::ManagerMissing(pip));
        }
        let mut command = Command::new(&pip);
        command.args(["show", package]);
        run_show(command).await
    }

    async fn prepare_env(&self, env: &Path) -> Result<(), PackageError> {
        let pip = pip_path(env);
        if !pip.is_file() {
            return Err(PackageError::ManagerMissing(pip));
        }
        let mut command = Command::new(&pip);
        command.args(["install", "--upgrade", "--quiet", "pip"]);
        run_step("pip upgrade", command, PIP_UPGRADE_TIMEOUT).await
    }
}

#[derive(Debug, Clone)]
pub struct UvPackageManager {
    uv: PathBuf,
}

#[async_trait]
impl PackageManager for UvPackageManager {
    fn name(&self) -> &'static str {
        "uv"
    }

    async fn install(&self, env: &Path, spec: &PackageSpec, force: bool) -> Result<(), PackageError> {
        let mut command = Command::new(&self.uv);
        command
            .args(["pip", "install", "--upgrade", "--quiet"])
            .env("VIRTUAL_ENV", env);
        if force {
            command.arg("--force-reinstall");
        }
        command.arg(spec.render());
        run_install(command, spec).await
    }

    async fn installed_version(&self, env: &Path, package: &str) -> Result<Option<String>, PackageError> {
        let mut command = Command::new(&self.uv);
        command.args(["pip", "show", package]).env("VIRTUAL_ENV", env);
        run_show(command).await
    }

    async fn create_env(&self, python: &str, env: &Path) -> Result<(), PackageError> {
        let mut command = Command::new(&self.uv);
        command.args(["venv", "--quiet", "--python", python]).arg(env);
        run_step("create virtual environment", command, ENV_TIMEOUT).await
    }
}

async fn run_install(mut command: Command, spec: &PackageSpec) -> Result<(), PackageError> {
    info!(spec = %spec, "Installing package");
    command.kill_on_drop(true);
    let output = tokio::time::timeout(INSTALL_TIMEOUT, command.output())
        .await
        .map_err(|_| PackageError::Timeout(INSTALL_TIMEOUT))??;

    if !output.status.success() {
        return Err(PackageError::InstallFailed {
            spec: spec.render(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    info!(spec = %spec, "Package installed");
    Ok(())
}

async fn run_step(step: &'static str, mut command: Command, timeout: Duration) -> Result<(), PackageError> {
    debug!(step, "Running package step");
    command.kill_on_drop(true);
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| PackageError::Timeout(timeout))??;
    if !output.status.success() {
        return Err(PackageError::StepFailed {
            step,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

async fn run_show(mut command: Command) -> Result<Option<String>, PackageError> {
    command.kill_on_drop(true);
    let output = command.output().await?;
    if !output.status.success() {
        // `show` fails for packages that are not installed.
        debug!(status = %output.status, "Package not installed");
        return Ok(None);
    }
    Ok(parse_show_version(&String::from_utf8_lossy(&output.stdout)))
}

/// Extracts the `Version:` field of `pip show` output.
pub fn parse_show_version(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Version:"))
        .map(|version| version.trim().to_string())
        .filter(|version| !version.is_empty())
}

/// Orders two PEP 440 versions, so `1.0.0rc1 < 1.0.0 < 1.0.0.post1` and
/// `1.0.0.dev1 < 1.0.0a1`. `None` when either side does not parse.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let parse = |raw: &str| match Version::from_str(raw.trim().trim_start_matches('v')) {
        Ok(version) => Some(version),
        Err(e) => {
            debug!(version = raw, error = %e, "Not a PEP 440 version");
            None
        }
    };
    Some(parse(a)?.cmp(&parse(b)?))
}

/// Whether an installed version meets a request. A range that does not parse
/// is never met, so the install runs and the package manager decides.
pub fn satisfies(installed: &str, requested: &VersionReq) -> bool {
    match requested {
        VersionReq::Latest => true,
        VersionReq::Exact(version) => {
            installed == version || compare_versions(installed, version) == Some(Ordering::Equal)
        }
        VersionReq::Range(range) => {
            match (
                VersionSpecifiers::from_str(range),
                Version::from_str(installed.trim()),
            ) {
                (Ok(specifiers), Ok(version)) => specifiers.contains(&version),
                _ => false,
            }
        }
    }
}

// =============================================================================
// Provisioning
// =============================================================================

/// What [`provision`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProvisionReport {
    pub created_env: bool,
    pub installed: bool,
}

/// Readies the environment at `env` before the first launch: creates it when
/// missing, prepares it, and installs `spec` unless the installed version
/// already satisfies it and `entry_point` exists.
pub async fn provision(
    packages: &dyn PackageManager,
    python: &str,
    env: &Path,
    spec: &PackageSpec,
    entry_point: &Path,
) -> Result<ProvisionReport, PackageError> {
    let mut report = ProvisionReport::default();

    if env.join("pyvenv.cfg").is_file() {
        debug!(env = %env.display(), "Using existing virtual environment");
    } else {
        info!(env = %env.display(), python, "Creating virtual environment");
        packages.create_env(python, env).await?;
        report.created_env = true;
    }
    packages.prepare_env(env).await?;

    let installed = if report.created_env {
        None
    } else {
        packages.installed_version(env, &spec.name).await?
    };
    match installed {
        Some(version) if satisfies(&version, &spec.version) && entry_point.exists() => {
            info!(version = %version, spec = %spec, "Installed package satisfies request");
        }
        installed => {
            info!(
                installed = installed.as_deref().unwrap_or("none"),
                spec = %spec,
                manager = packages.name(),
                "Installing worker package"
            );
            packages.install(env, spec, false).await?;
            report.installed = true;
        }
    }
    Ok(report)
}

// =============================================================================
// Installed-version cache
// =============================================================================

/// Memoizes installed versions for a fixed time.
#[derive(Debug)]
pub struct VersionCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl VersionCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A cache that never hits.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn get(&self, package: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries
            .get(package)
            .filter(|(_, stored)| stored.elapsed() < self.ttl)
            .map(|(version, _)| version.clone())
    }

    pub fn put(&self, package: &str, version: &str) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(package.to_string(), (version.to_string(), Instant::now()));
    }

    pub fn invalidate(&self, package: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(package);
    }
}

impl Default for VersionCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}
