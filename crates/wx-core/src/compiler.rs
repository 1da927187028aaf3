use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::bundler::{Bundler, CommandBundler, Target};
use crate::config::WxConfig;
use crate::error::{Error, Result, Stage};
use crate::ssr::{self, Props};
use crate::view::CompiledView;
use crate::vm::{NodeVm, ScriptError, ScriptVm};

pub const DEFAULT_EXTENSION: &str = "svelte";

/// Compiles every component source in a views directory into a
/// [`CompiledView`]: a browser bundle, a server bundle, and the stylesheet the
/// server bundle emits when rendered with empty props.
pub struct Compiler {
    views_dir: PathBuf,
    extension: String,
    bundler: Box<dyn Bundler>,
    vm: Box<dyn ScriptVm>,
}

impl Compiler {
    pub fn new(
        views_dir: impl Into<PathBuf>,
        bundler: Box<dyn Bundler>,
        vm: Box<dyn ScriptVm>,
    ) -> Self {
        Self {
            views_dir: views_dir.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            bundler,
            vm,
        }
    }

    /// Compiler for the app rooted at `root`, using the configured bundler
    /// and VM executables.
    pub fn from_config(root: &Path, config: &WxConfig) -> Self {
        let bundler = CommandBundler::new(config.bundler.program.clone())
            .with_args(config.bundler.args.clone())
            .with_working_dir(root);
        let vm = NodeVm::new(config.vm.program.clone(), config.vm.args.clone());
        Self::new(root.join(&config.views_dir), Box::new(bundler), Box::new(vm))
            .with_extension(config.extension.clone())
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn views_dir(&self) -> &Path {
        &self.views_dir
    }

    pub fn compile(&mut self) -> Result<Vec<CompiledView>> {
        let dir = self.views_dir.clone();
        self.compile_dir(&dir)
    }

    /// Compiles the sources of `dir` in file name order. The first failure
    /// aborts the batch.
    pub fn compile_dir(&mut self, dir: &Path) -> Result<Vec<CompiledView>> {
        let sources = self.sources(dir)?;
        let mut views = Vec::with_capacity(sources.len());
        for (name, path) in sources {
            views.push(self.compile_view(&name, &path)?);
        }
        info!(dir = %dir.display(), views = views.len(), "views compiled");
        Ok(views)
    }

    pub fn close(mut self) -> Result<()> {
        self.vm.close().map_err(|e| Error::Vm(e.message))
    }

    fn sources(&self, dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
        let mut sources = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::io(dir, e))?.path();
            if !path.is_file() {
                continue;
            }
            let matches_ext = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == self.extension)
                .unwrap_or(false);
            if !matches_ext {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            sources.push((name.to_string(), path.clone()));
        }
        sources.sort_by(|a, b| a.1.file_name().cmp(&b.1.file_name()));
        Ok(sources)
    }

    fn compile_view(&mut self, name: &str, path: &Path) -> Result<CompiledView> {
        debug!(view = name, source = %path.display(), "compiling view");
        let dom = self
            .bundler
            .bundle(path, Target::Browser)
            .map_err(|e| Error::compile(name, Stage::Dom, e))?;
        let ssr = self
            .bundler
            .bundle(path, Target::Server)
            .map_err(|e| Error::compile(name, Stage::Ssr, e))?;
        let css = self
            .extract_css(&ssr)
            .map_err(|e| Error::compile(name, Stage::Css, e))?;
        let view = CompiledView::new(name, dom, ssr, css);
        debug!(
            view = name,
            dom = %view.dom_hash,
            ssr = %view.ssr_hash,
            css = %view.css_hash,
            "view hashed"
        );
        Ok(view)
    }

    // The compiler's VM lives across batches, so each bundle is unloaded
    // once its stylesheet is read.
    fn extract_css(&mut self, ssr_script: &[u8]) -> std::result::Result<Vec<u8>, ScriptError> {
        let handle = ssr::load(self.vm.as_mut(), ssr_script)?;
        let output = ssr::execute(self.vm.as_mut(), handle, &Props::new());
        let unloaded = self.vm.unload(handle);
        let css = output?.css.code.into_bytes();
        unloaded?;
        Ok(css)
    }
}
