use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::debug;

/// Execution environment a bundle is produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Browser,
    Server,
}

impl Target {
    /// Global the IIFE bundle assigns its exports to.
    pub fn global_name(self) -> &'static str {
        match self {
            Target::Browser => "__dom__",
            Target::Server => "__ssr__",
        }
    }

    pub fn platform(self) -> &'static str {
        match self {
            Target::Browser => "browser",
            Target::Server => "node",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.platform())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{diagnostic}")]
pub struct BundleError {
    pub diagnostic: String,
}

impl BundleError {
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: diagnostic.into(),
        }
    }
}

/// Turns a component entry file into one self-contained script.
pub trait Bundler: Send + Sync {
    fn bundle(&self, entry: &Path, target: Target) -> Result<Vec<u8>, BundleError>;
}

/// Bundler backed by an esbuild-compatible executable writing the bundle to
/// stdout. `args` are passed before the generated flags, which is where
/// plugin wrappers take their own options.
#[derive(Debug, Clone)]
pub struct CommandBundler {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandBundler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self, entry: &Path, target: Target) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(entry)
            .arg("--bundle")
            .arg("--format=iife")
            .arg(format!("--global-name={}", target.global_name()))
            .arg("--minify")
            .arg("--ignore-annotations")
            .arg(format!("--platform={}", target.platform()))
            .arg("--log-level=error");
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl Bundler for CommandBundler {
    fn bundle(&self, entry: &Path, target: Target) -> Result<Vec<u8>, BundleError> {
        debug!(program = %self.program, entry = %entry.display(), %target, "bundling");
        let output = self
            .command(entry, target)
            .output()
            .map_err(|e| BundleError::new(format!("failed to run {}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let diagnostic = first_diagnostic(&stderr)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} exited with {}", self.program, output.status));
            return Err(BundleError::new(diagnostic));
        }
        Ok(output.stdout)
    }
}

pub(crate) fn first_diagnostic(stderr: &str) -> Option<&str> {
    stderr.lines().map(str::trim).find(|line| !line.is_empty())
}
