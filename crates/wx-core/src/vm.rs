use std::collections::HashMap;
use std::io::Write;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::trace;

use crate::bundler::first_diagnostic;

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Handle to a script loaded into a specific [`ScriptVm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptHandle(pub usize);

/// Sandboxed script interpreter.
///
/// Instances are not safe for concurrent calls; every method takes
/// `&mut self` and instances are handed out through a pool.
pub trait ScriptVm: Send {
    fn load(&mut self, name: &str, script: &[u8]) -> Result<ScriptHandle, ScriptError>;

    /// Drops a loaded script. The handle is invalid afterwards.
    fn unload(&mut self, handle: ScriptHandle) -> Result<(), ScriptError>;

    /// Evaluates `expression` in the scope of a loaded script and returns the
    /// string value it produced.
    fn evaluate(&mut self, handle: ScriptHandle, expression: &str) -> Result<String, ScriptError>;

    fn close(&mut self) -> Result<(), ScriptError>;
}

pub trait VmFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn ScriptVm>, ScriptError>;
}

impl<F> VmFactory for F
where
    F: Fn() -> Result<Box<dyn ScriptVm>, ScriptError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn ScriptVm>, ScriptError> {
        self()
    }
}

/// Script VM that runs each evaluation in a fresh node-compatible process.
///
/// Loaded scripts stay in memory until unloaded; an evaluation feeds the script followed by
/// the expression to the interpreter on stdin and returns its stdout.
#[derive(Debug)]
pub struct NodeVm {
    program: String,
    args: Vec<String>,
    scripts: HashMap<usize, (String, String)>,
    next_handle: usize,
    closed: bool,
}

impl NodeVm {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            scripts: HashMap::new(),
            next_handle: 0,
            closed: false,
        }
    }

    fn program_source(script: &str, expression: &str) -> String {
        let expression = expression.trim().trim_start_matches(';').trim();
        format!("{script}\n;process.stdout.write(String({expression}));\n")
    }

    fn ensure_open(&self) -> Result<(), ScriptError> {
        if self.closed {
            return Err(ScriptError::new("script vm is closed"));
        }
        Ok(())
    }
}

impl ScriptVm for NodeVm {
    fn load(&mut self, name: &str, script: &[u8]) -> Result<ScriptHandle, ScriptError> {
        self.ensure_open()?;
        let source = String::from_utf8(script.to_vec())
            .map_err(|e| ScriptError::new(format!("{name}: script is not valid utf-8: {e}")))?;
        let handle = ScriptHandle(self.next_handle);
        self.next_handle += 1;
        self.scripts.insert(handle.0, (name.to_string(), source));
        Ok(handle)
    }

    fn unload(&mut self, handle: ScriptHandle) -> Result<(), ScriptError> {
        self.ensure_open()?;
        self.scripts
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| ScriptError::new(format!("unknown script handle {}", handle.0)))
    }

    fn evaluate(&mut self, handle: ScriptHandle, expression: &str) -> Result<String, ScriptError> {
        self.ensure_open()?;
        let (name, script) = self
            .scripts
            .get(&handle.0)
            .ok_or_else(|| ScriptError::new(format!("unknown script handle {}", handle.0)))?;
        trace!(script = %name, "evaluating expression");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ScriptError::new(format!("failed to run {}: {e}", self.program)))?;

        let source = Self::program_source(script, expression);
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(source.as_bytes()) {
                drop(stdin);
                let _ = child.kill();
                let _ = child.wait();
                return Err(ScriptError::new(format!("{name}: failed to send script: {err}")));
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ScriptError::new(format!("{name}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = first_diagnostic(&stderr)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} exited with {}", self.program, output.status));
            return Err(ScriptError::new(format!("{name}: {message}")));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| ScriptError::new(format!("{name}: result is not valid utf-8: {e}")))
    }

    fn close(&mut self) -> Result<(), ScriptError> {
        self.ensure_open()?;
        self.closed = true;
        self.scripts.clear();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NodeVmFactory {
    program: String,
    args: Vec<String>,
}

impl NodeVmFactory {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Default for NodeVmFactory {
    fn default() -> Self {
        Self::new("node", Vec::new())
    }
}

impl VmFactory for NodeVmFactory {
    fn create(&self) -> Result<Box<dyn ScriptVm>, ScriptError> {
        Ok(Box::new(NodeVm::new(self.program.clone(), self.args.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_source_appends_expression_to_script() {
        let source = NodeVm::program_source(
            "var __ssr__ = {};",
            ";JSON.stringify(__ssr__.default.render({}))",
        );
        assert_eq!(
            source,
            "var __ssr__ = {};\n;process.stdout.write(String(JSON.stringify(__ssr__.default.render({}))));\n"
        );
    }

    #[test]
    fn closed_vm_rejects_calls() {
        let mut vm = NodeVm::new("node", Vec::new());
        let handle = vm.load("ssr.js", b"var x = 1;").expect("load");
        vm.close().expect("first close");
        assert!(vm.evaluate(handle, "x").is_err());
        assert!(vm.load("ssr.js", b"").is_err());
        assert!(vm.close().is_err());
    }

    #[test]
    fn unloaded_scripts_are_forgotten() {
        let mut vm = NodeVm::new("node", Vec::new());
        let first = vm.load("ssr.js", b"var a = 1;").expect("load");
        vm.unload(first).expect("unload");
        assert!(vm.scripts.is_empty());
        let second = vm.load("ssr.js", b"var b = 2;").expect("load");
        assert_ne!(first, second, "handles are not reused");
        assert!(vm.evaluate(first, "a").is_err());
        assert!(vm.unload(first).is_err());
    }

    #[test]
    fn unknown_handle_is_rejected() {
        let mut vm = NodeVm::new("node", Vec::new());
        let err = vm
            .evaluate(ScriptHandle(7), "1")
            .expect_err("no script loaded");
        assert!(err.message.contains("unknown script handle 7"));
    }

    #[test]
    fn closures_act_as_factories() {
        let factory = || -> Result<Box<dyn ScriptVm>, ScriptError> {
            Ok(Box::new(NodeVm::new("node", Vec::new())))
        };
        assert!(VmFactory::create(&factory).is_ok());
    }

    #[cfg(unix)]
    fn shell(script: &str) -> NodeVm {
        NodeVm::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[cfg(unix)]
    #[test]
    fn evaluate_returns_interpreter_stdout() {
        let mut vm = shell("cat");
        let handle = vm.load("ssr.js", b"var __ssr__ = {};").expect("load");
        let out = vm.evaluate(handle, ";render()").expect("evaluate");
        assert_eq!(out, NodeVm::program_source("var __ssr__ = {};", ";render()"));
    }

    #[cfg(unix)]
    #[test]
    fn failed_evaluation_reports_first_stderr_line() {
        let mut vm = shell("cat >/dev/null; echo '✘ [ERROR] x' >&2; echo more >&2; exit 1");
        let handle = vm.load("ssr.js", b"throw 1").expect("load");
        let err = vm.evaluate(handle, "1").expect_err("non-zero exit");
        assert_eq!(err.message, "ssr.js: ✘ [ERROR] x");
    }

    #[cfg(unix)]
    #[test]
    fn silent_failure_reports_exit_status() {
        let mut vm = shell("cat >/dev/null; exit 3");
        let handle = vm.load("ssr.js", b"").expect("load");
        let err = vm.evaluate(handle, "1").expect_err("non-zero exit");
        assert!(err.message.starts_with("ssr.js: sh exited with"), "{}", err.message);
    }

    #[cfg(unix)]
    #[test]
    fn interpreter_that_stops_reading_is_killed() {
        let mut vm = shell("exec 0<&-; sleep 30");
        let script = vec![b'x'; 1 << 20];
        let handle = vm.load("ssr.js", &script).expect("load");
        let started = std::time::Instant::now();
        let err = vm.evaluate(handle, "1").expect_err("stdin closed");
        assert!(err.message.contains("failed to send script"), "{}", err.message);
        assert!(started.elapsed() < std::time::Duration::from_secs(20));
    }
}
