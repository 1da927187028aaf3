//! In-memory bundler and script VM doubles.
//!
//! Component sources understood here are line based: `css: …`, `head: …` and
//! `html: …` lines describe the render result, `{key}` placeholders are filled
//! from props, `throw: …` makes every evaluation fail and `raw: …` returns the
//! text verbatim instead of a JSON document. A source containing `@error`
//! fails to bundle.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value, json};

use crate::bundler::{BundleError, Bundler, Target};
use crate::vm::{ScriptError, ScriptHandle, ScriptVm, VmFactory};

const RENDER_PREFIX: &str = ";JSON.stringify(__ssr__.default.render(";
const RENDER_SUFFIX: &str = "))";

#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateBundler;

impl Bundler for TemplateBundler {
    fn bundle(&self, entry: &Path, target: Target) -> Result<Vec<u8>, BundleError> {
        let source = fs::read_to_string(entry)
            .map_err(|e| BundleError::new(format!("{}: {e}", entry.display())))?;
        if source.contains("@error") {
            return Err(BundleError::new(format!(
                "{}: unexpected token \"@error\"",
                entry.display()
            )));
        }
        Ok(format!("// target: {target}\n{source}").into_bytes())
    }
}

/// Shared instrumentation for every VM created from one factory.
#[derive(Debug, Default)]
pub struct Probe {
    created: AtomicUsize,
    evaluations: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    close_calls: AtomicUsize,
    loaded: AtomicUsize,
    held: Mutex<bool>,
    released: Condvar,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes evaluations block until [`Probe::open`] is called.
    pub fn hold(&self) {
        *self.held.lock() = true;
    }

    pub fn open(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Scripts currently loaded across all VMs.
    pub fn loaded(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Polls until `active` evaluations are in flight or `timeout` passes.
    pub fn wait_for_active(&self, active: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.active() == active {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        self.active() == active
    }

    fn enter(&self) {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct TemplateVm {
    probe: Arc<Probe>,
    scripts: Vec<Option<String>>,
    closed: bool,
    fail_close: bool,
}

impl Default for TemplateVm {
    fn default() -> Self {
        Self::new(Probe::new())
    }
}

impl TemplateVm {
    pub fn new(probe: Arc<Probe>) -> Self {
        Self {
            probe,
            scripts: Vec::new(),
            closed: false,
            fail_close: false,
        }
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

impl ScriptVm for TemplateVm {
    fn load(&mut self, _name: &str, script: &[u8]) -> Result<ScriptHandle, ScriptError> {
        if self.closed {
            return Err(ScriptError::new("script vm is closed"));
        }
        self.scripts
            .push(Some(String::from_utf8_lossy(script).into_owned()));
        self.probe.loaded.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptHandle(self.scripts.len() - 1))
    }

    fn unload(&mut self, handle: ScriptHandle) -> Result<(), ScriptError> {
        if self.scripts.get_mut(handle.0).and_then(Option::take).is_none() {
            return Err(ScriptError::new(format!("unknown script handle {}", handle.0)));
        }
        self.probe.loaded.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn evaluate(&mut self, handle: ScriptHandle, expression: &str) -> Result<String, ScriptError> {
        if self.closed {
            return Err(ScriptError::new("script vm is closed"));
        }
        let script = self
            .scripts
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| ScriptError::new(format!("unknown script handle {}", handle.0)))?;
        self.probe.enter();
        let result = render_template(script, expression);
        self.probe.leave();
        result
    }

    fn close(&mut self) -> Result<(), ScriptError> {
        self.probe.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed = true;
        if self.fail_close {
            return Err(ScriptError::new("vm still busy"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct TemplateVmFactory {
    probe: Arc<Probe>,
    failing_closes: AtomicUsize,
    fail_create_at: Option<usize>,
}

impl TemplateVmFactory {
    pub fn new(probe: Arc<Probe>) -> Self {
        Self {
            probe,
            failing_closes: AtomicUsize::new(0),
            fail_create_at: None,
        }
    }

    /// The first `count` VMs created fail when closed.
    pub fn with_failing_closes(self, count: usize) -> Self {
        self.failing_closes.store(count, Ordering::SeqCst);
        self
    }

    /// The `index`-th call to `create` (zero based) fails.
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_create_at = Some(index);
        self
    }
}

impl VmFactory for TemplateVmFactory {
    fn create(&self) -> Result<Box<dyn ScriptVm>, ScriptError> {
        let index = self.probe.created.fetch_add(1, Ordering::SeqCst);
        if self.fail_create_at == Some(index) {
            return Err(ScriptError::new(format!("vm {index} failed to start")));
        }
        let vm = TemplateVm::new(Arc::clone(&self.probe));
        let fail_close = self
            .failing_closes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_close {
            return Ok(Box::new(vm.failing_close()));
        }
        Ok(Box::new(vm))
    }
}

fn render_template(script: &str, expression: &str) -> Result<String, ScriptError> {
    let props_json = expression
        .strip_prefix(RENDER_PREFIX)
        .and_then(|rest| rest.strip_suffix(RENDER_SUFFIX))
        .ok_or_else(|| ScriptError::new(format!("unsupported expression: {expression}")))?;
    let props: Map<String, Value> = serde_json::from_str(props_json)
        .map_err(|e| ScriptError::new(format!("invalid props: {e}")))?;

    let mut html = String::new();
    let mut head = String::new();
    let mut css = String::new();
    for line in script.lines() {
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        match key.trim() {
            "throw" => return Err(ScriptError::new(format!("Error: {value}"))),
            "raw" => return Ok(value.to_string()),
            "html" => html.push_str(&fill(value, &props)),
            "head" => head.push_str(&fill(value, &props)),
            "css" => css.push_str(value),
            _ => {}
        }
    }
    Ok(json!({"html": html, "head": head, "css": {"code": css}}).to_string())
}

fn fill(template: &str, props: &Map<String, Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in props {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&format!("{{{key}}}"), &text);
    }
    out
}
