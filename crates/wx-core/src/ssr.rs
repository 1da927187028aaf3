//! Server-side render calls against a loaded SSR bundle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::vm::{ScriptError, ScriptHandle, ScriptVm};

pub const SSR_SCRIPT_NAME: &str = "ssr.js";

pub type Props = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrCss {
    #[serde(default)]
    pub code: String,
}

/// Structured result of `__ssr__.default.render(props)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrOutput {
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub head: String,
    #[serde(default)]
    pub css: SsrCss,
}

pub fn render_expression(props_json: &str) -> String {
    format!(";JSON.stringify(__ssr__.default.render({props_json}))")
}

pub fn load(vm: &mut dyn ScriptVm, script: &[u8]) -> Result<ScriptHandle, ScriptError> {
    vm.load(SSR_SCRIPT_NAME, script)
}

pub fn execute(
    vm: &mut dyn ScriptVm,
    handle: ScriptHandle,
    props: &Props,
) -> Result<SsrOutput, ScriptError> {
    let props_json = serde_json::to_string(props)
        .map_err(|e| ScriptError::new(format!("failed to encode props: {e}")))?;
    let result = vm.evaluate(handle, &render_expression(&props_json))?;
    serde_json::from_str(&result)
        .map_err(|e| ScriptError::new(format!("failed to decode render result: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TemplateVm;
    use serde_json::json;

    #[test]
    fn execute_decodes_markup_head_and_css() {
        let mut vm = TemplateVm::default();
        let handle = load(
            &mut vm,
            b"css: h1{color:red}\nhead: <title>Hi</title>\nhtml: <h1>{count}</h1>",
        )
        .expect("load");
        let props = json!({"count": 3}).as_object().cloned().unwrap_or_default();
        let out = execute(&mut vm, handle, &props).expect("execute");
        assert_eq!(out.html, "<h1>3</h1>");
        assert_eq!(out.head, "<title>Hi</title>");
        assert_eq!(out.css.code, "h1{color:red}");
    }

    #[test]
    fn undecodable_result_is_a_script_error() {
        let mut vm = TemplateVm::default();
        let handle = load(&mut vm, b"raw: not json").expect("load");
        let err = execute(&mut vm, handle, &Props::new()).expect_err("must fail");
        assert!(err.message.starts_with("failed to decode render result"));
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let out: SsrOutput = serde_json::from_str(r#"{"html":"<p></p>"}"#).expect("decode");
        assert_eq!(out.head, "");
        assert_eq!(out.css.code, "");
    }
}
