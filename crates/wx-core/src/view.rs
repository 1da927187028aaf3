use std::borrow::Cow;
use std::sync::Arc;

use crate::hash::content_hash;

/// Browser bundle of a view, served under `/scripts/{file_name}`.
#[derive(Debug, Clone)]
pub struct ViewDom<'a> {
    pub file_name: Cow<'a, str>,
    pub script: &'a [u8],
}

/// Extracted stylesheet of a view, served under `/styles/{file_name}`.
#[derive(Debug, Clone)]
pub struct ViewCss<'a> {
    pub file_name: Cow<'a, str>,
    pub style: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct ViewSsr<'a> {
    pub script: &'a [u8],
}

/// A compiled component the render engine can serve.
///
/// Registrations are keyed by the identity of the shared allocation
/// (see [`ViewRef`]), never by [`View::name`].
pub trait View: Send + Sync {
    fn name(&self) -> &str;
    fn dom(&self) -> ViewDom<'_>;
    fn css(&self) -> ViewCss<'_>;
    fn ssr(&self) -> ViewSsr<'_>;
}

pub type ViewRef = Arc<dyn View>;

pub fn asset_file_name(name: &str, hash: &str, ext: &str) -> String {
    format!("{name}.{hash}.{ext}")
}

/// View backed by data embedded in the binary, as emitted by the generator.
#[derive(Debug, Clone, Copy)]
pub struct StaticView {
    pub name: &'static str,
    pub dom_file: &'static str,
    pub dom: &'static [u8],
    pub css_file: &'static str,
    pub css: &'static [u8],
    pub ssr: &'static [u8],
}

impl View for StaticView {
    fn name(&self) -> &str {
        self.name
    }

    fn dom(&self) -> ViewDom<'_> {
        ViewDom {
            file_name: Cow::Borrowed(self.dom_file),
            script: self.dom,
        }
    }

    fn css(&self) -> ViewCss<'_> {
        ViewCss {
            file_name: Cow::Borrowed(self.css_file),
            style: self.css,
        }
    }

    fn ssr(&self) -> ViewSsr<'_> {
        ViewSsr { script: self.ssr }
    }
}

/// Output of compiling one component source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledView {
    pub name: String,
    pub dom: Vec<u8>,
    pub dom_hash: String,
    pub ssr: Vec<u8>,
    pub ssr_hash: String,
    pub css: Vec<u8>,
    pub css_hash: String,
}

impl CompiledView {
    pub fn new(name: impl Into<String>, dom: Vec<u8>, ssr: Vec<u8>, css: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            dom_hash: content_hash(&dom),
            ssr_hash: content_hash(&ssr),
            css_hash: content_hash(&css),
            dom,
            ssr,
            css,
        }
    }

    pub fn dom_file_name(&self) -> String {
        asset_file_name(&self.name, &self.dom_hash, "js")
    }

    pub fn css_file_name(&self) -> String {
        asset_file_name(&self.name, &self.css_hash, "css")
    }
}

impl View for CompiledView {
    fn name(&self) -> &str {
        &self.name
    }

    fn dom(&self) -> ViewDom<'_> {
        ViewDom {
            file_name: Cow::Owned(self.dom_file_name()),
            script: &self.dom,
        }
    }

    fn css(&self) -> ViewCss<'_> {
        ViewCss {
            file_name: Cow::Owned(self.css_file_name()),
            style: &self.css,
        }
    }

    fn ssr(&self) -> ViewSsr<'_> {
        ViewSsr { script: &self.ssr }
    }
}
