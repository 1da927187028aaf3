#[cfg(feature = "axum")]
pub mod adapters;

#[cfg(feature = "axum")]
pub use adapters::axum::{WxRouter, render_view};

use serde_json::Value;
use wx_core::{Props, View};

pub const STYLES_PREFIX: &str = "/styles/";
pub const SCRIPTS_PREFIX: &str = "/scripts/";
pub const STATIC_PREFIX: &str = "/static";

pub const CSS_CONTENT_TYPE: &str = "text/css; charset=utf-8";
pub const JS_CONTENT_TYPE: &str = "application/javascript; charset=utf-8";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Asset file names carry a content hash, so they never change meaning.
pub const IMMUTABLE_CACHE: &str = "public, max-age=31536000, immutable";

/// URL path of a view's stylesheet.
pub fn style_path(view: &dyn View) -> String {
    format!("{STYLES_PREFIX}{}", view.css().file_name)
}

/// URL path of a view's browser bundle.
pub fn script_path(view: &dyn View) -> String {
    format!("{SCRIPTS_PREFIX}{}", view.dom().file_name)
}

/// Parses render props from a JSON object string. Empty input means no props.
pub fn parse_props(raw: &str) -> Result<Props, String> {
    if raw.trim().is_empty() {
        return Ok(Props::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("props must be a JSON object, got {other}")),
        Err(e) => Err(format!("invalid props JSON: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wx_core::CompiledView;

    #[test]
    fn asset_paths_use_hashed_file_names() {
        let view = CompiledView::new("Welcome", b"d".to_vec(), b"s".to_vec(), b"c".to_vec());
        assert_eq!(
            style_path(&view),
            format!("/styles/Welcome.{}.css", view.css_hash)
        );
        assert_eq!(
            script_path(&view),
            format!("/scripts/Welcome.{}.js", view.dom_hash)
        );
    }

    #[test]
    fn props_must_be_an_object() {
        assert!(parse_props("").expect("empty").is_empty());
        let props = parse_props(r#"{"count": 3}"#).expect("object");
        assert_eq!(props.get("count"), Some(&Value::from(3)));
        assert!(parse_props("[1]").is_err());
        assert!(parse_props("{count").is_err());
    }
}
