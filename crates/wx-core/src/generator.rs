//! Emits Rust source that embeds compiled views as [`crate::StaticView`]s,
//! so a release binary can serve them without the bundler or the sources.

use std::collections::HashMap;
use std::io::Write;

use crate::error::{Error, Result};
use crate::view::CompiledView;

const BYTES_PER_LINE: usize = 12;

pub struct Generator<'a> {
    views: &'a [CompiledView],
}

impl<'a> Generator<'a> {
    pub fn new(views: &'a [CompiledView]) -> Self {
        Self { views }
    }

    pub fn generate<W: Write>(&self, out: &mut W) -> Result<()> {
        let source = self.render()?;
        out.write_all(source.as_bytes())
            .map_err(|e| Error::Generate(e.to_string()))
    }

    /// Builds the generated module as a string.
    pub fn render(&self) -> Result<String> {
        let idents = self.idents()?;
        let mut src = String::from(
            "// Code generated by wx. DO NOT EDIT.\n\n\
             use std::sync::{Arc, LazyLock};\n\n\
             use wx_core::{StaticView, ViewRef};\n",
        );
        for (view, ident) in self.views.iter().zip(&idents) {
            src.push('\n');
            src.push_str(&static_view(view, ident));
        }
        src.push_str("\npub fn views() -> Vec<ViewRef> {\n    vec![");
        for ident in &idents {
            src.push_str(&format!("\n        Arc::clone(&{ident}),"));
        }
        if !idents.is_empty() {
            src.push_str("\n    ");
        }
        src.push_str("]\n}\n");
        Ok(src)
    }

    fn idents(&self) -> Result<Vec<String>> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        let mut idents = Vec::with_capacity(self.views.len());
        for view in self.views {
            let ident = format!("{}_VIEW", screaming_snake(&view.name));
            if let Some(other) = seen.insert(ident.clone(), &view.name) {
                return Err(Error::Generate(format!(
                    "views {other:?} and {:?} both map to {ident}",
                    view.name
                )));
            }
            idents.push(ident);
        }
        Ok(idents)
    }
}

fn static_view(view: &CompiledView, ident: &str) -> String {
    format!(
        "pub static {ident}: LazyLock<ViewRef> = LazyLock::new(|| {{\n    \
         Arc::new(StaticView {{\n        \
         name: {name:?},\n        \
         dom_file: {dom_file:?},\n        \
         dom: {dom},\n        \
         css_file: {css_file:?},\n        \
         css: {css},\n        \
         ssr: {ssr},\n    \
         }})\n}});\n",
        name = view.name,
        dom_file = view.dom_file_name(),
        dom = byte_slice(&view.dom),
        css_file = view.css_file_name(),
        css = byte_slice(&view.css),
        ssr = byte_slice(&view.ssr),
    )
}

fn byte_slice(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "&[]".to_string();
    }
    let mut out = String::from("&[");
    for chunk in bytes.chunks(BYTES_PER_LINE) {
        out.push_str("\n            ");
        let line: Vec<String> = chunk.iter().map(|b| format!("0x{b:02X},")).collect();
        out.push_str(&line.join(" "));
    }
    out.push_str("\n        ]");
    out
}

/// `TodoList` -> `TODO_LIST`, `user-card` -> `USER_CARD`.
fn screaming_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if ch.is_ascii_uppercase() && prev_lower && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch.to_ascii_uppercase());
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    let trimmed = out.trim_end_matches('_');
    match trimmed.chars().next() {
        None => "_".to_string(),
        Some(c) if c.is_ascii_digit() => format!("_{trimmed}"),
        Some(_) => trimmed.to_string(),
    }
}
