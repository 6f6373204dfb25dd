//! OS package updates through the host's package manager
//!
//! Output is returned as captured. Interpreting a manager's listing format
//! is left to the console.

use super::shell::run_program;
use super::types::CommandOutput;
use crate::error::{Error, Result};
use std::path::Path;

/// Package managers the agent can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    /// Debian and Ubuntu
    Apt,
    /// RHEL, CentOS and Fedora
    Yum,
    /// Alpine
    Apk,
}

/// One program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    program: &'static str,
    args: Vec<String>,
}

impl Invocation {
    fn new(program: &'static str, args: &[&str]) -> Self {
        Self {
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    async fn run(&self) -> CommandOutput {
        run_program(self.program, &self.args).await
    }
}

impl PackageManager {
    /// Detect from `/etc/os-release`, then from the binaries on `PATH`
    pub fn detect() -> Option<Self> {
        std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| Self::from_os_release(&content))
            .or_else(Self::from_path)
    }

    fn from_os_release(content: &str) -> Option<Self> {
        let content = content.to_lowercase();
        if content.contains("alpine") {
            Some(Self::Apk)
        } else if content.contains("ubuntu") || content.contains("debian") {
            Some(Self::Apt)
        } else if ["centos", "rhel", "red hat", "fedora"]
            .iter()
            .any(|distro| content.contains(distro))
        {
            Some(Self::Yum)
        } else {
            None
        }
    }

    fn from_path() -> Option<Self> {
        let path = std::env::var_os("PATH")?;
        let on_path = |bin: &str| std::env::split_paths(&path).any(|dir| is_file(&dir.join(bin)));
        [
            ("apk", Self::Apk),
            ("apt-get", Self::Apt),
            ("yum", Self::Yum),
            ("dnf", Self::Yum),
        ]
        .into_iter()
        .find(|(bin, _)| on_path(bin))
        .map(|(_, manager)| manager)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Apt => "apt",
            Self::Yum => "yum",
            Self::Apk => "apk",
        }
    }

    /// Cache refresh run before listing
    fn refresh(self) -> Option<Invocation> {
        match self {
            Self::Apt => Some(Invocation::new("apt-get", &["update", "-qq"])),
            Self::Apk => Some(Invocation::new("apk", &["update"])),
            // check-update refreshes metadata itself
            Self::Yum => None,
        }
    }

    fn list(self) -> Invocation {
        match self {
            Self::Apt => Invocation::new("apt", &["list", "--upgradable"]),
            // Exits 100 when updates are pending
            Self::Yum => Invocation::new("yum", &["check-update", "-q"]),
            Self::Apk => Invocation::new("apk", &["list", "--upgradable"]),
        }
    }

    fn apply(self, package: &str) -> Invocation {
        match self {
            Self::Apt => Invocation::new("apt-get", &["install", "-y", package]),
            Self::Yum => Invocation::new("yum", &["update", "-y", package]),
            Self::Apk => Invocation::new("apk", &["add", "--upgrade", package]),
        }
    }

    fn apply_all(self) -> Invocation {
        match self {
            Self::Apt => Invocation::new("apt-get", &["upgrade", "-y"]),
            Self::Yum => Invocation::new("yum", &["update", "-y"]),
            Self::Apk => Invocation::new("apk", &["upgrade"]),
        }
    }
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

/// Lists and installs OS package updates
#[derive(Debug, Clone)]
pub struct PackageUpdater {
    manager: Option<PackageManager>,
}

impl PackageUpdater {
    pub fn new(manager: Option<PackageManager>) -> Self {
        Self { manager }
    }

    /// Use whatever package manager this host has
    pub fn detect() -> Self {
        let manager = PackageManager::detect();
        match manager {
            Some(manager) => tracing::debug!(manager = manager.name(), "Package manager detected"),
            None => tracing::warn!("No supported package manager found; update actions will fail"),
        }
        Self { manager }
    }

    pub fn manager(&self) -> Option<PackageManager> {
        self.manager
    }

    fn require(&self) -> Result<PackageManager> {
        self.manager.ok_or_else(|| {
            Error::Collection("no supported package manager on this host".to_string())
        })
    }

    /// Refresh the package cache and list what can be upgraded
    pub async fn list(&self) -> Result<CommandOutput> {
        let manager = self.require()?;
        if let Some(refresh) = manager.refresh() {
            let output = refresh.run().await;
            if output.exit_code != 0 {
                tracing::warn!(
                    manager = manager.name(),
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "Package cache refresh failed, listing from stale cache"
                );
            }
        }
        Ok(manager.list().run().await)
    }

    pub async fn apply(&self, package: &str) -> Result<CommandOutput> {
        let manager = self.require()?;
        tracing::info!(manager = manager.name(), package, "Applying package update");
        Ok(manager.apply(package).run().await)
    }

    pub async fn apply_all(&self) -> Result<CommandOutput> {
        let manager = self.require()?;
        tracing::info!(manager = manager.name(), "Applying all package updates");
        Ok(manager.apply_all().run().await)
    }
}
