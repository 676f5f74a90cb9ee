//! Process supervisor — runs the external image build tool, streams its
//! output into the build log, and enforces a hard wall-clock deadline.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use walkdir::WalkDir;

use crate::config::Config;
use crate::distro;

/// Package set installed into every image.
const PACKAGES: &str = "iputils-ping,curl,qemu-guest-agent,vim";
/// Most recent output lines kept for failure diagnostics, across both
/// streams.
const TAIL_LINES: usize = 50;

/// Receives build output line by line, live. Backed by the record store
/// in production so a build can be tailed while it runs.
pub trait LogSink: Send + Sync {
    fn append_line(&self, line: &str);
}

/// Failure of one build-tool run. Carries the tail of recent output so
/// the cause is visible without trawling the full log.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unknown distro '{distro}': {reason}")]
    UnknownDistro { distro: String, reason: String },
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("build failed: {cause}{}", render_tail(.tail))]
    Failed { cause: String, tail: Vec<String> },
    #[error("build timed out after {}s{}", .timeout.as_secs(), render_tail(.tail))]
    TimedOut { timeout: Duration, tail: Vec<String> },
}

fn render_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        return String::new();
    }
    let mut out = String::from(". Last output:\n");
    for line in tail {
        out.push_str("  > ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

struct TailBuffer {
    lines: VecDeque<String>,
    cap: usize,
}

impl TailBuffer {
    fn new(cap: usize) -> Self {
        Self { lines: VecDeque::with_capacity(cap), cap }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

pub struct Builder {
    command: String,
    elements_dir: PathBuf,
    distro_dir: PathBuf,
    work_dir: PathBuf,
    build_timeout: Duration,
    manager_address: String,
    ssh_inject_key: String,
}

impl Builder {
    pub fn new(config: &Config) -> Self {
        Self {
            command: config.build_command.clone(),
            elements_dir: PathBuf::from(&config.elements_dir),
            distro_dir: PathBuf::from(&config.distro_config_dir),
            work_dir: PathBuf::from(&config.work_dir),
            build_timeout: config.build_timeout(),
            manager_address: config.manager_address.clone(),
            ssh_inject_key: config.ssh_inject_key.clone(),
        }
    }

    /// Where the build tool leaves the finished image for a given name.
    pub fn artifact_path(&self, image_name: &str) -> PathBuf {
        self.work_dir.join(format!("{image_name}.qcow2"))
    }

    /// The build tool silently requires element scripts to be executable;
    /// a file landed by any unpack step may not be. Enforced before every
    /// run, never assumed.
    pub fn ensure_scripts_executable(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        for entry in WalkDir::new(&self.elements_dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let in_script_dir = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".d"))
                .unwrap_or(false);
            if in_script_dir {
                std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(0o755))
                    .with_context(|| format!("failed to chmod {}", entry.path().display()))?;
            }
        }
        Ok(())
    }

    /// Run the build tool for one image under the configured deadline.
    /// Every output line goes to `sink` immediately; the most recent 50
    /// lines ride along in the error on failure.
    pub async fn build_image(
        &self,
        image_name: &str,
        distro: &str,
        sink: Arc<dyn LogSink>,
    ) -> Result<(), BuildError> {
        if let Err(e) = self.ensure_scripts_executable() {
            tracing::warn!("failed to ensure executable permissions: {e:#}");
        }

        let profile_name = distro::resolve_alias(distro);
        let profile = distro::load(&self.distro_dir, profile_name).map_err(|e| {
            BuildError::UnknownDistro { distro: distro.to_string(), reason: format!("{e:#}") }
        })?;

        tracing::info!(
            image = image_name,
            distro,
            timeout_secs = self.build_timeout.as_secs(),
            "starting build process"
        );

        let mut args: Vec<String> = Vec::new();
        if !profile.os_element.is_empty() {
            args.push(profile.os_element.clone());
        }
        args.extend(profile.elements.iter().cloned());
        args.push("-p".to_string());
        args.push(PACKAGES.to_string());
        args.push("-o".to_string());
        args.push(image_name.to_string());

        let mut cmd = Command::new(&self.command);
        cmd.args(&args)
            .current_dir(&self.work_dir)
            .env("ELEMENTS_PATH", &self.elements_dir)
            .env("DIB_CLOUD_INIT_DATASOURCES", "OpenStack,ConfigDrive,None")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if self.manager_address.is_empty() {
            tracing::warn!("manager address is empty, agent might not connect back");
        } else {
            cmd.env("MANAGER_ADDRESS", &self.manager_address);
        }
        if !self.ssh_inject_key.is_empty() {
            cmd.env("SSH_INJECT_KEY", &self.ssh_inject_key);
        }
        for (key, value) in &profile.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| BuildError::Spawn {
            command: self.command.clone(),
            source: e,
        })?;

        let tail = Arc::new(Mutex::new(TailBuffer::new(TAIL_LINES)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(drain_lines(stdout, sink.clone(), tail.clone(), "STDOUT"));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(drain_lines(stderr, sink.clone(), tail.clone(), "STDERR"));
        }

        let waited = tokio::time::timeout(self.build_timeout, child.wait()).await;

        // A timed-out child must die before we collect the tail.
        let exit = match waited {
            Ok(wait_result) => Some(wait_result),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };
        for reader in readers {
            let _ = reader.await;
        }
        let tail_lines = tail.lock().unwrap().snapshot();

        match exit {
            None => Err(BuildError::TimedOut { timeout: self.build_timeout, tail: tail_lines }),
            Some(Err(e)) => Err(BuildError::Failed {
                cause: format!("failed to wait for build tool: {e}"),
                tail: tail_lines,
            }),
            Some(Ok(status)) if status.success() => {
                tracing::info!(image = image_name, "build completed successfully");
                Ok(())
            }
            Some(Ok(status)) => {
                let cause = match status.code() {
                    Some(code) => format!("exit status {code}"),
                    None => "terminated by signal".to_string(),
                };
                Err(BuildError::Failed { cause, tail: tail_lines })
            }
        }
    }

    /// Remove local build artifacts for an image. Best-effort; runs on
    /// every pipeline exit path.
    pub fn cleanup(&self, image_name: &str) {
        tracing::info!(image = image_name, "cleaning up build artifacts");

        let _ = std::fs::remove_file(self.work_dir.join(image_name));
        let _ = std::fs::remove_file(self.artifact_path(image_name));
        let _ = std::fs::remove_dir_all(self.work_dir.join(format!("{image_name}.d")));

        if let Ok(entries) = std::fs::read_dir(&self.work_dir) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else { continue };
                if name.starts_with("dib-manifest-") && name.contains(image_name) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }
}

fn drain_lines<R>(
    stream: R,
    sink: Arc<dyn LogSink>,
    tail: Arc<Mutex<TailBuffer>>,
    label: &'static str,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "imageforge::build_tool", "[{label}] {line}");
            if label == "STDOUT" && line.contains("Converting image") {
                sink.append_line(
                    ">>> Build logic finished. Converting raw image to qcow2 (final step)...",
                );
            }
            sink.append_line(&line);
            tail.lock().unwrap().push(format!("[{label}] {line}"));
        }
    })
}
