//! Rendering toolchain bootstrap: make sure the machine can rasterise PDF
//! pages before the first rasterisation attempt, installing what is missing.
//!
//! Minimal container images routinely ship without Python imaging libraries
//! or poppler. Every step here is best effort: a probe that fails triggers an
//! install attempt, an install that fails (no network, no root, unsupported
//! distribution) is logged, and the run carries on with pages in degraded mode.
//! Nothing in this module returns an error.
//!
//! Steps, in order:
//! 1. interpreter invocable? If not, stop; nothing else can help
//! 2. Python modules importable? If not, `pip install --user`
//! 3. system rasteriser on `PATH`? If not, OS package manager install

use crate::config::AnalysisConfig;
use crate::pipeline::process::{run_bounded, tail_line, ProcessError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one probe-and-repair step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// Already available.
    Present,
    /// Was missing and has been installed.
    Installed,
    /// Missing and could not be installed.
    Missing { reason: String },
    /// Not checked (an earlier step failed, or bootstrap is disabled).
    Skipped,
}

impl ProbeOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Present | Self::Installed)
    }
}

/// What the bootstrapper found and fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub interpreter: ProbeOutcome,
    pub libraries: ProbeOutcome,
    pub system_tool: ProbeOutcome,
}

impl BootstrapReport {
    pub fn skipped() -> Self {
        Self {
            interpreter: ProbeOutcome::Skipped,
            libraries: ProbeOutcome::Skipped,
            system_tool: ProbeOutcome::Skipped,
        }
    }

    /// `false` means rasterisation will probably fail and pages will degrade.
    pub fn is_complete(&self) -> bool {
        self.interpreter.is_available()
            && self.libraries.is_available()
            && self.system_tool.is_available()
    }
}

/// Ensures the environment can rasterise pages. Never fails.
#[async_trait]
pub trait EnvironmentBootstrap: Send + Sync {
    async fn ensure_ready(&self) -> BootstrapReport;
}

/// Does nothing; used when bootstrap is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBootstrap;

#[async_trait]
impl EnvironmentBootstrap for NoBootstrap {
    async fn ensure_ready(&self) -> BootstrapReport {
        BootstrapReport::skipped()
    }
}

// ── OS detection ─────────────────────────────────────────────────────────────

/// Linux distribution family, as far as package installation is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsFamily {
    Debian,
    RedHat,
    Alpine,
    Suse,
    Unsupported(String),
}

impl OsFamily {
    /// Classify from the contents of an `os-release` file using `ID` and
    /// `ID_LIKE`.
    pub fn from_os_release(contents: &str) -> Self {
        let mut ids: Vec<String> = Vec::new();
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if matches!(key.trim(), "ID" | "ID_LIKE") {
                let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                ids.extend(value.split_whitespace().map(str::to_ascii_lowercase));
            }
        }

        for id in &ids {
            match id.as_str() {
                "debian" | "ubuntu" => return Self::Debian,
                "rhel" | "centos" | "fedora" | "amzn" | "rocky" | "almalinux" | "ol" => {
                    return Self::RedHat
                }
                "alpine" => return Self::Alpine,
                "suse" | "opensuse" | "sles" | "opensuse-leap" | "opensuse-tumbleweed" => {
                    return Self::Suse
                }
                _ => {}
            }
        }
        Self::Unsupported(ids.first().cloned().unwrap_or_else(|| "unknown".into()))
    }

    /// Non-interactive commands that install poppler, run in order.
    pub fn install_steps(&self) -> &'static [&'static [&'static str]] {
        match self {
            Self::Debian => &[
                &["apt-get", "update", "-qq"],
                &["apt-get", "install", "-y", "-qq", "poppler-utils"],
            ],
            // yum is present on every member of the family (a dnf alias on newer ones).
            Self::RedHat => &[&["yum", "install", "-y", "poppler-utils"]],
            Self::Alpine => &[&["apk", "add", "--no-cache", "poppler-utils"]],
            Self::Suse => &[&["zypper", "--non-interactive", "install", "poppler-tools"]],
            Self::Unsupported(_) => &[],
        }
    }
}

// ── System bootstrap ─────────────────────────────────────────────────────────

const NONINTERACTIVE_ENV: (&str, &str) = ("DEBIAN_FRONTEND", "noninteractive");

/// Probes and repairs the real machine.
#[derive(Debug, Clone)]
pub struct SystemBootstrap {
    interpreter: String,
    python_modules: Vec<String>,
    python_packages: Vec<String>,
    system_tool: String,
    os_release: PathBuf,
    timeout: Duration,
}

impl SystemBootstrap {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            python_modules: config.python_modules.clone(),
            python_packages: config.python_packages.clone(),
            system_tool: config.system_tool.clone(),
            os_release: PathBuf::from("/etc/os-release"),
            timeout: Duration::from_secs(config.install_timeout_secs),
        }
    }

    pub fn with_os_release(mut self, path: impl Into<PathBuf>) -> Self {
        self.os_release = path.into();
        self
    }

    async fn probe_interpreter(&self) -> ProbeOutcome {
        match run_bounded(&self.interpreter, &["--version"], &[], self.timeout).await {
            Ok(out) if out.status.success() => {
                debug!(
                    "Interpreter {} present: {}",
                    self.interpreter,
                    tail_line(if out.stdout.is_empty() { &out.stderr } else { &out.stdout })
                );
                ProbeOutcome::Present
            }
            Ok(out) => ProbeOutcome::Missing {
                reason: format!("'{} --version' exited with {}", self.interpreter, out.status),
            },
            Err(e) => ProbeOutcome::Missing {
                reason: e.to_string(),
            },
        }
    }

    async fn modules_importable(&self) -> bool {
        if self.python_modules.is_empty() {
            return true;
        }
        let code = format!("import {}", self.python_modules.join(", "));
        matches!(
            run_bounded(&self.interpreter, &["-c", &code], &[], self.timeout).await,
            Ok(out) if out.status.success()
        )
    }

    async fn ensure_libraries(&self) -> ProbeOutcome {
        if self.modules_importable().await {
            return ProbeOutcome::Present;
        }
        info!(
            "Python modules [{}] missing; installing [{}] for the current user",
            self.python_modules.join(", "),
            self.python_packages.join(", ")
        );

        let mut args = vec!["-m", "pip", "install", "--user", "--quiet"];
        args.extend(self.python_packages.iter().map(String::as_str));
        let attempt = run_bounded(&self.interpreter, &args, &[], self.timeout).await;

        match attempt {
            Ok(out) if out.status.success() && self.modules_importable().await => {
                ProbeOutcome::Installed
            }
            Ok(out) => ProbeOutcome::Missing {
                reason: format!("pip install failed: {}", tail_line(&out.stderr)),
            },
            Err(e) => ProbeOutcome::Missing {
                reason: format!("pip install failed: {e}"),
            },
        }
    }

    async fn tool_on_path(&self) -> bool {
        match run_bounded(&self.system_tool, &["-v"], &[], self.timeout).await {
            Ok(_) => true,
            Err(e) => !e.is_not_found(),
        }
    }

    async fn ensure_system_tool(&self) -> ProbeOutcome {
        if self.tool_on_path().await {
            return ProbeOutcome::Present;
        }

        let family = match tokio::fs::read_to_string(&self.os_release).await {
            Ok(contents) => OsFamily::from_os_release(&contents),
            Err(e) => {
                debug!("Cannot read {}: {}", self.os_release.display(), e);
                OsFamily::Unsupported("unknown".into())
            }
        };
        if let OsFamily::Unsupported(id) = &family {
            return ProbeOutcome::Missing {
                reason: format!(
                    "'{}' not found and OS family '{}' is unsupported for automatic install",
                    self.system_tool, id
                ),
            };
        }

        info!("'{}' not found; installing via {:?} package manager", self.system_tool, family);
        for step in family.install_steps() {
            if let Err(reason) = self.run_privileged(step).await {
                return ProbeOutcome::Missing { reason };
            }
        }

        if self.tool_on_path().await {
            ProbeOutcome::Installed
        } else {
            ProbeOutcome::Missing {
                reason: format!("'{}' still not on PATH after install", self.system_tool),
            }
        }
    }

    /// Run directly; when that fails, retry once through `sudo -n` so a
    /// password prompt can never block the run.
    async fn run_privileged(&self, step: &[&str]) -> Result<(), String> {
        let Some((program, args)) = step.split_first() else {
            return Ok(());
        };

        let direct = run_bounded(program, args, &[NONINTERACTIVE_ENV], self.timeout).await;
        let direct_reason = match direct {
            Ok(out) if out.status.success() => return Ok(()),
            Ok(out) => format!("{} exited with {}: {}", step.join(" "), out.status, tail_line(&out.stderr)),
            Err(e) => e.to_string(),
        };
        debug!("Direct install step failed ({}); trying sudo -n", direct_reason);

        let env_arg = format!("{}={}", NONINTERACTIVE_ENV.0, NONINTERACTIVE_ENV.1);
        let mut sudo_args = vec!["-n", "env", env_arg.as_str()];
        sudo_args.extend_from_slice(step);
        match run_bounded("sudo", &sudo_args, &[], self.timeout).await {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(format!(
                "{direct_reason}; sudo -n: {}",
                tail_line(&out.stderr)
            )),
            Err(ProcessError::Spawn { .. }) => Err(format!("{direct_reason}; sudo unavailable")),
            Err(e) => Err(format!("{direct_reason}; sudo -n: {e}")),
        }
    }
}

#[async_trait]
impl EnvironmentBootstrap for SystemBootstrap {
    async fn ensure_ready(&self) -> BootstrapReport {
        let interpreter = self.probe_interpreter().await;
        if !interpreter.is_available() {
            warn!(
                "Rendering bootstrap stopped: interpreter '{}' unavailable ({:?})",
                self.interpreter, interpreter
            );
            return BootstrapReport {
                interpreter,
                libraries: ProbeOutcome::Skipped,
                system_tool: ProbeOutcome::Skipped,
            };
        }

        let libraries = self.ensure_libraries().await;
        if let ProbeOutcome::Missing { reason } = &libraries {
            warn!("Python rendering libraries unavailable: {}", reason);
        }

        let system_tool = self.ensure_system_tool().await;
        if let ProbeOutcome::Missing { reason } = &system_tool {
            warn!("System rasteriser unavailable: {}", reason);
        }

        let report = BootstrapReport {
            interpreter,
            libraries,
            system_tool,
        };
        info!("Rendering bootstrap finished (complete: {})", report.is_complete());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn bootstrap(interpreter: &str, tool: &str) -> SystemBootstrap {
        let config = AnalysisConfig::builder()
            .interpreter(interpreter)
            .system_tool(tool)
            .install_timeout_secs(5)
            .build()
            .unwrap();
        SystemBootstrap::from_config(&config)
    }

    #[test]
    fn os_release_debian_family() {
        let ubuntu = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"22.04\"\n";
        assert_eq!(OsFamily::from_os_release(ubuntu), OsFamily::Debian);
    }

    #[test]
    fn os_release_id_like_is_consulted() {
        let rocky = "ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";
        assert_eq!(OsFamily::from_os_release(rocky), OsFamily::RedHat);
        let mint = "ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n";
        assert_eq!(OsFamily::from_os_release(mint), OsFamily::Debian);
        let amazon = "ID=\"amzn\"\n";
        assert_eq!(OsFamily::from_os_release(amazon), OsFamily::RedHat);
    }

    #[test]
    fn os_release_other_families() {
        assert_eq!(OsFamily::from_os_release("ID=alpine\n"), OsFamily::Alpine);
        assert_eq!(
            OsFamily::from_os_release("ID=\"opensuse-leap\"\nID_LIKE=\"suse opensuse\"\n"),
            OsFamily::Suse
        );
    }

    #[test]
    fn os_release_unknown_family_is_unsupported() {
        assert_eq!(
            OsFamily::from_os_release("ID=plan9\n"),
            OsFamily::Unsupported("plan9".into())
        );
        assert_eq!(
            OsFamily::from_os_release(""),
            OsFamily::Unsupported("unknown".into())
        );
        assert!(OsFamily::Unsupported("x".into()).install_steps().is_empty());
    }

    #[test]
    fn install_steps_are_non_interactive() {
        for family in [OsFamily::Debian, OsFamily::RedHat, OsFamily::Alpine, OsFamily::Suse] {
            let steps = family.install_steps();
            assert!(!steps.is_empty());
            let last = steps.last().unwrap();
            assert!(
                last.iter()
                    .any(|a| *a == "-y" || *a == "--no-cache" || *a == "--non-interactive"),
                "{family:?}: {last:?}"
            );
        }
    }

    #[test]
    fn report_completeness() {
        assert!(!BootstrapReport::skipped().is_complete());
        let report = BootstrapReport {
            interpreter: ProbeOutcome::Present,
            libraries: ProbeOutcome::Installed,
            system_tool: ProbeOutcome::Present,
        };
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn missing_interpreter_stops_bootstrap() {
        let report = bootstrap("pdfdiff-no-such-python", "pdfdiff-no-such-tool")
            .ensure_ready()
            .await;
        assert!(matches!(report.interpreter, ProbeOutcome::Missing { .. }));
        assert_eq!(report.libraries, ProbeOutcome::Skipped);
        assert_eq!(report.system_tool, ProbeOutcome::Skipped);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn no_bootstrap_skips_everything() {
        assert_eq!(NoBootstrap.ensure_ready().await, BootstrapReport::skipped());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn everything_present_is_complete() {
        // `true` accepts any arguments and exits 0, standing in for each check.
        let report = bootstrap("true", "true").ensure_ready().await;
        assert_eq!(report.interpreter, ProbeOutcome::Present);
        assert_eq!(report.libraries, ProbeOutcome::Present);
        assert_eq!(report.system_tool, ProbeOutcome::Present);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unsupported_os_leaves_tool_missing() {
        let dir = tempfile::tempdir().unwrap();
        let os_release = dir.path().join("os-release");
        std::fs::write(&os_release, "ID=plan9\n").unwrap();

        let report = bootstrap("true", "pdfdiff-no-such-tool")
            .with_os_release(&os_release)
            .ensure_ready()
            .await;
        match report.system_tool {
            ProbeOutcome::Missing { reason } => assert!(reason.contains("unsupported"), "{reason}"),
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    /// Interpreter stand-in: imports succeed once `pip install` has run,
    /// and `pip install` exits with `pip_status`.
    #[cfg(unix)]
    fn stub_interpreter(dir: &Path, pip_status: u8) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let marker = dir.join("installed");
        let script = format!(
            "#!/bin/sh\n\
             case \"$1\" in\n\
             --version) echo 'Python 3.12.0' ;;\n\
             -c) test -f '{marker}' ;;\n\
             -m) [ {pip_status} -eq 0 ] && touch '{marker}'; exit {pip_status} ;;\n\
             *) exit 2 ;;\n\
             esac\n",
            marker = marker.display(),
        );
        let path = dir.join("python-stub");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_modules_are_installed_with_pip() {
        let dir = tempfile::tempdir().unwrap();
        let python = stub_interpreter(dir.path(), 0);

        let report = bootstrap(python.to_str().unwrap(), "true").ensure_ready().await;
        assert_eq!(report.interpreter, ProbeOutcome::Present);
        assert_eq!(report.libraries, ProbeOutcome::Installed);
        assert_eq!(report.system_tool, ProbeOutcome::Present);
        assert!(report.is_complete());
        assert!(dir.path().join("installed").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_pip_install_leaves_modules_missing() {
        let dir = tempfile::tempdir().unwrap();
        let python = stub_interpreter(dir.path(), 1);

        let report = bootstrap(python.to_str().unwrap(), "true").ensure_ready().await;
        assert_eq!(report.interpreter, ProbeOutcome::Present);
        match &report.libraries {
            ProbeOutcome::Missing { reason } => assert!(reason.contains("pip install"), "{reason}"),
            other => panic!("expected Missing, got {other:?}"),
        }
        assert!(!report.is_complete());
    }
}
