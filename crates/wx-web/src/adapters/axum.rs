use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Request};
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, Route, get};
use axum::Router;
use tower::{Layer, Service};
use tower_http::services::ServeDir;
use tracing::{debug, error};
use wx_core::{Props, RenderEngine, Result, VmFactory, ViewRef};

use crate::{
    CSS_CONTENT_TYPE, HTML_CONTENT_TYPE, IMMUTABLE_CACHE, JS_CONTENT_TYPE, SCRIPTS_PREFIX,
    STATIC_PREFIX, STYLES_PREFIX,
};

type Assets = HashMap<String, Bytes>;
type ApplyLayer = Box<dyn FnOnce(Router) -> Router + Send>;

/// axum router that serves registered views' assets next to app routes.
///
/// Assets are looked up by file name under one `/styles/{file}` and one
/// `/scripts/{file}` route, so view names never become route syntax.
pub struct WxRouter {
    router: Router,
    engine: Arc<RenderEngine>,
    styles: Assets,
    scripts: Assets,
    static_dir: Option<PathBuf>,
    layers: Vec<ApplyLayer>,
}

impl WxRouter {
    pub fn new(vms: Arc<dyn VmFactory>) -> Self {
        Self::with_engine(Arc::new(RenderEngine::new(vms)))
    }

    pub fn with_engine(engine: Arc<RenderEngine>) -> Self {
        Self {
            router: Router::new(),
            engine,
            styles: Assets::new(),
            scripts: Assets::new(),
            static_dir: None,
            layers: Vec::new(),
        }
    }

    pub fn engine(&self) -> &Arc<RenderEngine> {
        &self.engine
    }

    /// Registers each view with the engine and makes its stylesheet and
    /// browser bundle servable. Stops at the first registration error; views
    /// before it stay registered and served.
    pub fn register_views<I>(&mut self, views: I) -> Result<()>
    where
        I: IntoIterator<Item = ViewRef>,
    {
        for view in views {
            self.engine.register_views([Arc::clone(&view)])?;
            let css = view.css();
            let dom = view.dom();
            debug!(view = view.name(), css = %css.file_name, dom = %dom.file_name, "assets added");
            // Views with identical content share file names; the first one wins.
            self.styles
                .entry(css.file_name.into_owned())
                .or_insert_with(|| Bytes::copy_from_slice(css.style));
            self.scripts
                .entry(dom.file_name.into_owned())
                .or_insert_with(|| Bytes::copy_from_slice(dom.script));
        }
        Ok(())
    }

    /// Serves files below `dir` under `/static/`.
    pub fn static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    pub fn route(mut self, path: &str, method_router: MethodRouter) -> Self {
        self.router = self.router.route(path, method_router);
        self
    }

    /// Adds middleware around every route, including asset and static
    /// routes. Layers added later wrap the earlier ones.
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request>>::Error: Into<Infallible> + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        self.layers.push(Box::new(move |router: Router| router.layer(layer)));
        self
    }

    pub fn into_router(self) -> Router {
        let mut router = self.router;
        if !self.styles.is_empty() {
            router = router.route(
                &format!("{STYLES_PREFIX}{{file}}"),
                asset_handler(self.styles, CSS_CONTENT_TYPE),
            );
        }
        if !self.scripts.is_empty() {
            router = router.route(
                &format!("{SCRIPTS_PREFIX}{{file}}"),
                asset_handler(self.scripts, JS_CONTENT_TYPE),
            );
        }
        if let Some(dir) = self.static_dir {
            router = router.nest_service(STATIC_PREFIX, ServeDir::new(dir));
        }
        for apply in self.layers {
            router = apply(router);
        }
        router
    }
}

fn asset_handler(assets: Assets, content_type: &'static str) -> MethodRouter {
    let assets = Arc::new(assets);
    get(move |Path(file): Path<String>| {
        let body = assets.get(&file).cloned();
        async move {
            match body {
                Some(body) => (
                    [(CONTENT_TYPE, content_type), (CACHE_CONTROL, IMMUTABLE_CACHE)],
                    body,
                )
                    .into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
    })
}

/// Renders `view` off the async runtime. Any failure becomes a 500 carrying
/// the error text; partial HTML is never sent.
pub async fn render_view(engine: Arc<RenderEngine>, view: ViewRef, props: Props) -> Response {
    let name = view.name().to_string();
    let rendered = tokio::task::spawn_blocking(move || engine.render(&view, &props)).await;
    match rendered {
        Ok(Ok(html)) => (StatusCode::OK, [(CONTENT_TYPE, HTML_CONTENT_TYPE)], html).into_response(),
        Ok(Err(err)) => {
            error!(view = %name, error = %err, "render failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
        Err(err) => {
            error!(view = %name, error = %err, "render task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("wx: render task failed: {err}"),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;
    use wx_core::testing::{Probe, TemplateVmFactory};
    use wx_core::{CompiledView, Error};

    use crate::{script_path, style_path};

    fn welcome() -> ViewRef {
        Arc::new(CompiledView::new(
            "Welcome",
            b"var __dom__ = {};".to_vec(),
            b"html: <h1>{count}</h1>".to_vec(),
            b"h1{color:teal}".to_vec(),
        ))
    }

    fn broken() -> ViewRef {
        Arc::new(CompiledView::new(
            "Broken",
            Vec::new(),
            b"throw: props.user is undefined".to_vec(),
            Vec::new(),
        ))
    }

    fn router() -> WxRouter {
        WxRouter::new(Arc::new(TemplateVmFactory::new(Probe::new())))
    }

    fn page_route(engine: &Arc<RenderEngine>, view: &ViewRef) -> MethodRouter {
        let engine = Arc::clone(engine);
        let view = Arc::clone(view);
        get(move || {
            let props = json!({"count": 10}).as_object().cloned().unwrap_or_default();
            render_view(Arc::clone(&engine), Arc::clone(&view), props)
        })
    }

    async fn fetch(router: Router, uri: &str) -> (StatusCode, String, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.into_body().collect().await.expect("body").to_bytes();
        (status, content_type, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn serves_hashed_assets_with_content_types() {
        let view = welcome();
        let mut router = router();
        router.register_views([Arc::clone(&view)]).expect("register");
        let app = router.into_router();

        let (status, content_type, body) = fetch(app.clone(), &style_path(view.as_ref())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, CSS_CONTENT_TYPE);
        assert_eq!(body, "h1{color:teal}");

        let (status, content_type, body) = fetch(app.clone(), &script_path(view.as_ref())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, JS_CONTENT_TYPE);
        assert_eq!(body, "var __dom__ = {};");

        let (status, _, _) = fetch(app, "/styles/Welcome.stale.css").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn renders_pages_and_reports_failures_as_500() {
        let welcome = welcome();
        let broken = broken();
        let mut router = router();
        router
            .register_views([Arc::clone(&welcome), Arc::clone(&broken)])
            .expect("register");
        let engine = Arc::clone(router.engine());
        let app = router
            .route("/", page_route(&engine, &welcome))
            .route("/broken", page_route(&engine, &broken))
            .into_router();

        let (status, content_type, body) = fetch(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, HTML_CONTENT_TYPE);
        assert!(body.contains("<h1>10</h1>"));
        assert!(body.contains(&style_path(welcome.as_ref())));

        let (status, _, body) = fetch(app, "/broken").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            "wx: failed to render Broken: Error: props.user is undefined"
        );
    }

    #[tokio::test]
    async fn identical_assets_are_stored_once() {
        let mut router = router();
        router
            .register_views([welcome(), welcome()])
            .expect("distinct allocations register");
        assert_eq!(router.engine().len(), 2);
        assert_eq!(router.styles.len(), 1);
        assert_eq!(router.scripts.len(), 1);
    }

    #[tokio::test]
    async fn view_names_are_not_route_syntax() {
        let braces: ViewRef = Arc::new(CompiledView::new(
            "Card{",
            b"card()".to_vec(),
            Vec::new(),
            b".card{}".to_vec(),
        ));
        let spaced: ViewRef = Arc::new(CompiledView::new(
            "My Card",
            b"my_card()".to_vec(),
            Vec::new(),
            b".my-card{}".to_vec(),
        ));
        let mut router = router();
        router
            .register_views([Arc::clone(&braces), Arc::clone(&spaced)])
            .expect("register");
        let app = router.into_router();

        let encode = |path: String| path.replace('{', "%7B").replace(' ', "%20");
        let (status, _, body) = fetch(app.clone(), &encode(style_path(braces.as_ref()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ".card{}");

        let (status, content_type, body) =
            fetch(app, &encode(script_path(spaced.as_ref()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, JS_CONTENT_TYPE);
        assert_eq!(body, "my_card()");
    }

    #[tokio::test]
    async fn static_dir_is_served_under_static() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("robots.txt"), "User-agent: *\n").expect("write");
        let app = router().static_dir(dir.path()).into_router();

        let (status, _, body) = fetch(app.clone(), "/static/robots.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "User-agent: *\n");

        let (status, _, _) = fetch(app, "/static/missing.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    async fn tag_response(request: Request<Body>, next: axum::middleware::Next) -> Response {
        let mut response = next.run(request).await;
        response
            .headers_mut()
            .insert("x-served-by", axum::http::HeaderValue::from_static("wx"));
        response
    }

    #[tokio::test]
    async fn layers_wrap_app_and_asset_routes() {
        let view = welcome();
        let mut router = router();
        router.register_views([Arc::clone(&view)]).expect("register");
        let app = router
            .route("/health", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(tag_response))
            .into_router();

        for uri in ["/health".to_string(), style_path(view.as_ref())] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(&uri).body(Body::empty()).expect("request"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            assert_eq!(
                response.headers().get("x-served-by").and_then(|v| v.to_str().ok()),
                Some("wx"),
                "{uri}"
            );
        }
    }

    #[tokio::test]
    async fn duplicate_view_is_an_error() {
        let view = welcome();
        let mut router = router();
        router.register_views([Arc::clone(&view)]).expect("register");
        let err = router
            .register_views([view])
            .expect_err("already registered");
        assert!(matches!(err, Error::DuplicateRegistration { .. }));
    }
}
