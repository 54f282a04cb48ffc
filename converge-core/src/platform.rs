//! Host platform capabilities.
//!
//! The operating system is detected once at startup and selects a
//! [`PlatformOps`] implementation. Install and uninstall procedures are
//! returned as command lists so callers decide whether to run or print them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// An agent distributed as a downloadable installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPackage {
    pub name: String,
    pub installer_url: String,
    /// Overrides the platform's default install location.
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
}

impl AgentPackage {
    pub fn new(name: impl Into<String>, installer_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installer_url: installer_url.into(),
            install_dir: None,
        }
    }
}

/// Operations whose implementation differs per operating system.
pub trait PlatformOps: Send + Sync {
    fn platform(&self) -> Platform;

    /// Where the file-backed remote keeps state by default.
    fn default_state_dir(&self) -> PathBuf;

    fn install_dir(&self, package: &AgentPackage) -> PathBuf;

    fn is_installed(&self, package: &AgentPackage) -> bool {
        self.install_dir(package).exists()
    }

    /// Steps installing `package`. Empty when it is already installed.
    fn install_steps(&self, package: &AgentPackage) -> Vec<CommandSpec>;

    /// Steps removing `package`. Empty when it is not installed.
    fn uninstall_steps(&self, package: &AgentPackage) -> Vec<CommandSpec>;
}

pub struct Linux;

impl PlatformOps for Linux {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn default_state_dir(&self) -> PathBuf {
        PathBuf::from("/var/lib/converge")
    }

    fn install_dir(&self, package: &AgentPackage) -> PathBuf {
        package
            .install_dir
            .clone()
            .unwrap_or_else(|| Path::new("/opt").join(&package.name))
    }

    fn install_steps(&self, package: &AgentPackage) -> Vec<CommandSpec> {
        if self.is_installed(package) {
            return Vec::new();
        }
        let script = format!("/tmp/{}-install.sh", package.name);
        let dir = self.install_dir(package).display().to_string();
        vec![
            CommandSpec::new(
                "curl",
                [
                    "-sSf",
                    "--connect-timeout",
                    "30",
                    "-o",
                    script.as_str(),
                    package.installer_url.as_str(),
                ],
            ),
            CommandSpec::new("/bin/sh", [script.as_str(), "-q", "-dir", dir.as_str()]),
            CommandSpec::new("rm", ["-f", script.as_str()]),
        ]
    }

    fn uninstall_steps(&self, package: &AgentPackage) -> Vec<CommandSpec> {
        if !self.is_installed(package) {
            return Vec::new();
        }
        let dir = self.install_dir(package);
        let uninstaller = dir.join("uninstall").display().to_string();
        vec![
            CommandSpec::new("/bin/sh", [uninstaller.as_str(), "-q"]),
            CommandSpec::new("rm", ["-rf".to_string(), dir.display().to_string()]),
        ]
    }
}

pub struct Windows;

impl PlatformOps for Windows {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn default_state_dir(&self) -> PathBuf {
        PathBuf::from(r"C:\ProgramData\converge")
    }

    fn install_dir(&self, package: &AgentPackage) -> PathBuf {
        package
            .install_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!(r"C:\{}", package.name)))
    }

    fn install_steps(&self, package: &AgentPackage) -> Vec<CommandSpec> {
        if self.is_installed(package) {
            return Vec::new();
        }
        let installer = format!(r"$env:TEMP\{}-install.exe", package.name);
        let dir = self.install_dir(package).display().to_string();
        vec![
            CommandSpec::new(
                "powershell",
                [
                    "-NoProfile".to_string(),
                    "-Command".to_string(),
                    format!(
                        "Invoke-WebRequest -Uri '{}' -OutFile \"{}\"",
                        package.installer_url, installer
                    ),
                ],
            ),
            CommandSpec::new(
                "powershell",
                [
                    "-NoProfile".to_string(),
                    "-Command".to_string(),
                    format!(
                        "Start-Process -Wait -FilePath \"{}\" -ArgumentList '-q','-dir','{}'",
                        installer, dir
                    ),
                ],
            ),
        ]
    }

    fn uninstall_steps(&self, package: &AgentPackage) -> Vec<CommandSpec> {
        if !self.is_installed(package) {
            return Vec::new();
        }
        let uninstaller = self.install_dir(package).join("uninstall.exe");
        vec![CommandSpec::new(
            uninstaller.display().to_string(),
            ["-q"],
        )]
    }
}

/// Supported operating systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    /// The platform this binary was built for.
    pub fn detect() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    pub fn ops(self) -> Box<dyn PlatformOps> {
        match self {
            Platform::Linux => Box::new(Linux),
            Platform::Windows => Box::new(Windows),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => f.write_str("linux"),
            Platform::Windows => f.write_str("windows"),
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            other => Err(Error::invalid(format!("unsupported platform {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(dir: &Path) -> AgentPackage {
        AgentPackage {
            install_dir: Some(dir.join("agent")),
            ..AgentPackage::new("agent", "https://example.com/agent.sh")
        }
    }

    #[test]
    fn test_detect_matches_build_target() {
        let platform = Platform::detect();
        assert_eq!(platform.ops().platform(), platform);
        if cfg!(target_os = "linux") {
            assert_eq!(platform, Platform::Linux);
        }
    }

    #[test]
    fn test_linux_steps_depend_on_install_state() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = package(tmp.path());

        let install = Linux.install_steps(&pkg);
        assert_eq!(install.len(), 3);
        assert_eq!(install[0].program, "curl");
        assert!(install[0].args.contains(&"https://example.com/agent.sh".to_string()));
        assert!(Linux.uninstall_steps(&pkg).is_empty());

        std::fs::create_dir_all(tmp.path().join("agent")).unwrap();
        assert!(Linux.is_installed(&pkg));
        assert!(Linux.install_steps(&pkg).is_empty());
        assert_eq!(Linux.uninstall_steps(&pkg).len(), 2);
    }

    #[test]
    fn test_windows_default_dirs() {
        let pkg = AgentPackage::new("sumo", "https://example.com/sumo.exe");
        assert_eq!(Windows.install_dir(&pkg), PathBuf::from(r"C:\sumo"));
        assert_eq!(
            Windows.default_state_dir(),
            PathBuf::from(r"C:\ProgramData\converge")
        );
    }

    #[test]
    fn test_platform_parse_and_display() {
        assert_eq!("Windows".parse::<Platform>().unwrap(), Platform::Windows);
        assert!("solaris".parse::<Platform>().is_err());
        assert_eq!(
            CommandSpec::new("sh", ["-c", "echo hi"]).to_string(),
            "sh -c \"echo hi\""
        );
    }
}
