use std::fmt;

use tracing::warn;

use crate::error::{Error, Result};
use crate::pool::Close;
use crate::ssr::{self, Props, SsrOutput};
use crate::view::{View, ViewRef};
use crate::vm::{ScriptError, ScriptHandle, ScriptVm};

/// One script VM with one view's SSR bundle loaded into it.
///
/// Not reentrant: `render` takes `&mut self`, and workers are shared between
/// requests only through a [`crate::pool::Pool`].
pub struct RenderWorker {
    view: ViewRef,
    vm: Box<dyn ScriptVm>,
    handle: ScriptHandle,
}

impl RenderWorker {
    pub fn new(view: ViewRef, mut vm: Box<dyn ScriptVm>) -> Result<Self> {
        let handle = match ssr::load(vm.as_mut(), view.ssr().script) {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(close_err) = vm.close() {
                    warn!(
                        view = view.name(),
                        error = %close_err,
                        "failed to close vm of unusable worker"
                    );
                }
                return Err(render_error(view.as_ref(), err));
            }
        };
        Ok(Self { view, vm, handle })
    }

    pub fn view(&self) -> &ViewRef {
        &self.view
    }

    /// Runs the SSR bundle once with `props`.
    pub fn render(&mut self, props: &Props) -> Result<SsrOutput> {
        ssr::execute(self.vm.as_mut(), self.handle, props)
            .map_err(|err| render_error(self.view.as_ref(), err))
    }

    /// Renders the full hydrating HTML document for `props`.
    pub fn render_page(&mut self, props: &Props) -> Result<String> {
        let output = self.render(props)?;
        let props_json = serde_json::to_string(props).map_err(|e| Error::Render {
            view: self.view.name().to_string(),
            message: format!("failed to encode props: {e}"),
        })?;
        Ok(document(self.view.as_ref(), &output, &props_json))
    }
}

impl Close for RenderWorker {
    type Error = ScriptError;

    fn close(&mut self) -> std::result::Result<(), ScriptError> {
        self.vm.close()
    }
}

impl fmt::Debug for RenderWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderWorker")
            .field("view", &self.view.name())
            .field("handle", &self.handle)
            .finish()
    }
}

fn render_error(view: &dyn View, err: ScriptError) -> Error {
    Error::Render {
        view: view.name().to_string(),
        message: err.message,
    }
}

fn document(view: &dyn View, output: &SsrOutput, props_json: &str) -> String {
    let css_file = escape_html(&view.css().file_name);
    let dom_file = escape_html(&view.dom().file_name);
    let props = escape_script_json(props_json);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta http-equiv="X-UA-Compatible" content="IE=edge">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<link rel="stylesheet" href="/styles/{css_file}">
{head}
</head>
<body>
<div id="app">{html}</div>
<script src="/scripts/{dom_file}"></script>
<script>
var view = new __dom__.default({{
  target: document.getElementById('app'),
  hydrate: true,
  props: {props},
}});
</script>
</body>
</html>
"#,
        head = output.head,
        html = output.html,
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Keeps JSON embedded in an inline script from closing the element.
fn escape_script_json(json: &str) -> String {
    json.replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Probe, TemplateVm};
    use crate::view::CompiledView;
    use serde_json::json;
    use std::sync::Arc;

    fn welcome() -> ViewRef {
        Arc::new(CompiledView::new(
            "Welcome",
            b"var __dom__ = {};".to_vec(),
            b"head: <title>Welcome</title>\nhtml: <p>count is {count}</p>".to_vec(),
            b"p{margin:0}".to_vec(),
        ))
    }

    fn props(value: serde_json::Value) -> Props {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn render_returns_markup_and_head() {
        let mut worker =
            RenderWorker::new(welcome(), Box::new(TemplateVm::default())).expect("worker");
        let out = worker.render(&props(json!({"count": 2}))).expect("render");
        assert_eq!(out.html, "<p>count is 2</p>");
        assert_eq!(out.head, "<title>Welcome</title>");
    }

    #[test]
    fn page_links_hashed_assets_and_embeds_props() {
        let view = welcome();
        let mut worker =
            RenderWorker::new(Arc::clone(&view), Box::new(TemplateVm::default())).expect("worker");
        let page = worker
            .render_page(&props(json!({"count": 10})))
            .expect("render page");
        assert!(page.contains(r#""count":10"#));
        assert!(page.contains(&format!("/styles/{}", view.css().file_name)));
        assert!(page.contains(&format!("/scripts/{}", view.dom().file_name)));
        assert!(page.contains(r#"<div id="app"><p>count is 10</p></div>"#));
    }

    #[test]
    fn props_cannot_close_the_hydration_script() {
        let mut worker =
            RenderWorker::new(welcome(), Box::new(TemplateVm::default())).expect("worker");
        let page = worker
            .render_page(&props(json!({"count": "</script><script>alert(1)"})))
            .expect("render page");
        assert!(page.contains(r#""count":"\u003c/script\u003e"#));
        assert_eq!(page.matches("</script>").count(), 3);
    }

    #[test]
    fn script_failures_surface_as_render_errors() {
        let view: ViewRef = Arc::new(CompiledView::new(
            "Broken",
            Vec::new(),
            b"throw: props.user is undefined".to_vec(),
            Vec::new(),
        ));
        let probe = Probe::new();
        let mut worker =
            RenderWorker::new(view, Box::new(TemplateVm::new(Arc::clone(&probe)))).expect("worker");
        let err = worker.render(&Props::new()).expect_err("script throws");
        assert_eq!(
            err.to_string(),
            "wx: failed to render Broken: Error: props.user is undefined"
        );
        assert_eq!(probe.evaluations(), 1, "no retry");
    }

    #[test]
    fn failed_load_closes_the_vm() {
        let probe = Probe::new();
        let mut vm = TemplateVm::new(Arc::clone(&probe)).failing_close();
        vm.close().expect_err("close fails but marks the vm closed");
        let err = RenderWorker::new(welcome(), Box::new(vm)).expect_err("closed vm rejects load");
        assert_eq!(
            err.to_string(),
            "wx: failed to render Welcome: script vm is closed"
        );
        assert_eq!(probe.close_calls(), 2);
    }
}
