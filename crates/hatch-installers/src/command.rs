//! Subprocess helpers shared by the command-driven backends.

use crate::installer::{BackendConfig, InstallContext};
use crate::InstallerError;
use std::fmt;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub(crate) fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run a command to completion without cancellation support.
pub(crate) fn query(program: &str, args: &[&str]) -> Result<CommandOutput, InstallerError> {
    debug!("query: {program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| spawn_error(program, &e))?;
    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command, polling the context for cancellation and timeout.
///
/// On cancellation or deadline the child is killed and the matching
/// context error is returned. A non-zero exit is `CommandFailed`.
pub(crate) fn run(
    program: &str,
    args: &[String],
    ctx: &InstallContext,
) -> Result<CommandOutput, InstallerError> {
    let rendered = format!("{program} {}", args.join(" "));
    debug!("run: {rendered}");
    ctx.check()?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(program, &e))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Err(e) = ctx.check() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
    let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

    if !status.success() {
        return Err(InstallerError::CommandFailed {
            command: rendered,
            code: status.code(),
            stderr: stderr.trim().to_owned(),
        });
    }
    Ok(CommandOutput {
        success: true,
        stdout,
        stderr,
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn spawn_error(program: &str, e: &std::io::Error) -> InstallerError {
    if e.kind() == std::io::ErrorKind::NotFound {
        InstallerError::ToolMissing(program.to_owned())
    } else {
        InstallerError::CommandFailed {
            command: program.to_owned(),
            code: None,
            stderr: e.to_string(),
        }
    }
}

/// Check a pip/semver style constraint (`>=2.28.0`, `==1.24.0`, `~=1.4`,
/// comma-separated ranges) against an installed version.
///
/// Versions are padded to three components. Anything that cannot be
/// interpreted as semver is reported as unsatisfied so the backend
/// reinstalls rather than guesses.
pub fn version_satisfies(installed: &str, constraint: Option<&str>) -> bool {
    let Some(constraint) = constraint.map(str::trim).filter(|c| !c.is_empty()) else {
        return true;
    };
    let Ok(version) = semver::Version::parse(&pad_version(installed)) else {
        return false;
    };
    let translated: Vec<String> = constraint
        .split(',')
        .map(|part| {
            let part = part.trim();
            let (op, rest) = split_operator(part);
            let op = match op {
                "==" => "=",
                "~=" => "~",
                other => other,
            };
            format!("{op}{}", pad_version(rest.trim()))
        })
        .collect();
    semver::VersionReq::parse(&translated.join(", "))
        .map(|req| req.matches(&version))
        .unwrap_or(false)
}

fn split_operator(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| c.is_ascii_alphanumeric())
        .unwrap_or(s.len());
    s.split_at(end)
}

fn pad_version(v: &str) -> String {
    let dots = v.matches('.').count();
    match dots {
        0 if !v.is_empty() => format!("{v}.0.0"),
        1 => format!("{v}.0"),
        _ => v.to_owned(),
    }
}

/// A missing backend executable with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

/// Check the executables the system backends shell out to.
/// Returns a list of missing items. Empty list means all are present.
pub fn check_backend_prereqs(config: &BackendConfig) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists(&config.python) {
        missing.push(MissingPrereq {
            name: config.python.clone(),
            purpose: "runtime (python) dependencies",
            install_hint: "apt install python3 python3-pip | dnf install python3-pip",
        });
    }

    if !command_exists(&config.apt_get) || !command_exists(&config.dpkg_query) {
        missing.push(MissingPrereq {
            name: config.apt_get.clone(),
            purpose: "system dependencies",
            install_hint: "available on Debian/Ubuntu hosts only",
        });
    }

    if !command_exists(&config.docker) {
        missing.push(MissingPrereq {
            name: config.docker.clone(),
            purpose: "container dependencies",
            install_hint: "https://docs.docker.com/engine/install/",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nDependencies of the affected kinds cannot be installed.");
    msg
}
