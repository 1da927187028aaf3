use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use axum::extract::{Path as AxumPath, Query};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{MethodRouter, get};
use clap::{Parser, Subcommand};
use tower_http::trace::TraceLayer;
use tracing::info;
use wx_core::{
    CONFIG_FILE, CompiledView, Compiler, Generator, NodeVmFactory, RenderEngine, ViewRef,
    WxConfig,
};
use wx_web::{WxRouter, parse_props, render_view};

const WELCOME_TEMPLATE: &str = include_str!("../templates/Welcome.svelte");
const CONFIG_TEMPLATE: &str = include_str!("../templates/wx.config.json");

#[derive(Parser, Debug)]
#[command(name = "wx")]
#[command(about = "Compile component views and serve them with server-side rendering")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Compile views and write the generated Rust module
    Build {
        /// App directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Output file (defaults to `out` from wx.config.json)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Create a new app directory
    Init { dir: PathBuf },
    /// Compile views in memory and serve them
    Serve {
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
    /// Print the wx version
    Version,
}

pub async fn run_from_env() -> Result<()> {
    run(Cli::parse()).await
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Build { dir, out } => {
            let count = build(&dir, out)?;
            println!("wx: {count} views compiled");
            Ok(())
        }
        Command::Init { dir } => init(&dir),
        Command::Serve { dir, port } => serve(&dir, port).await,
        Command::Version => {
            println!("wx {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn compile_app(dir: &Path) -> Result<(WxConfig, Vec<CompiledView>)> {
    let config = WxConfig::load(dir)?;
    let mut compiler = Compiler::from_config(dir, &config);
    let compiled = compiler.compile();
    let closed = compiler.close();
    let views = compiled
        .with_context(|| format!("failed to compile views in {}", dir.display()))?;
    closed?;
    Ok((config, views))
}

fn build(dir: &Path, out: Option<PathBuf>) -> Result<usize> {
    let (config, views) = compile_app(dir)?;
    let out = out.unwrap_or_else(|| dir.join(&config.out));
    write_views(&views, &out)?;
    Ok(views.len())
}

fn write_views(views: &[CompiledView], out: &Path) -> Result<()> {
    let source = Generator::new(views).render()?;
    fs::write(out, source).with_context(|| format!("failed to write {}", out.display()))?;
    info!(out = %out.display(), views = views.len(), "generated views module");
    Ok(())
}

fn init(dir: &Path) -> Result<()> {
    if dir.exists() {
        bail!("directory {} already exists", dir.display());
    }
    let views = dir.join("views");
    fs::create_dir_all(&views)
        .with_context(|| format!("failed to create {}", views.display()))?;
    for (path, content) in [
        (dir.join(CONFIG_FILE), CONFIG_TEMPLATE),
        (views.join("Welcome.svelte"), WELCOME_TEMPLATE),
    ] {
        println!("creating {}", path.display());
        fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

async fn serve(dir: &Path, port: u16) -> Result<()> {
    let root = dir.to_path_buf();
    let (config, compiled) = tokio::task::spawn_blocking(move || compile_app(&root))
        .await
        .context("compile task failed")??;

    let vms = Arc::new(NodeVmFactory::new(
        config.vm.program.clone(),
        config.vm.args.clone(),
    ));
    let engine = Arc::new(RenderEngine::with_config(vms, config.engine_config()));
    let views: Vec<ViewRef> = compiled
        .into_iter()
        .map(|view| Arc::new(view) as ViewRef)
        .collect();

    let mut router = WxRouter::with_engine(Arc::clone(&engine));
    router.register_views(views.iter().cloned())?;
    let mut pages = HashMap::new();
    for view in &views {
        info!(view = view.name(), path = %format!("/{}", view.name()), "view routed");
        pages.insert(view.name().to_string(), Arc::clone(view));
    }
    let mut router = router.route("/{view}", pages_route(&engine, pages));
    let static_dir = dir.join("static");
    if static_dir.is_dir() {
        info!(dir = %static_dir.display(), "serving static files");
        router = router.static_dir(static_dir);
    }
    let app = router.layer(TraceLayer::new_for_http()).into_router();

    let host = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&host)
        .await
        .with_context(|| format!("failed to bind {host}"))?;
    println!("wx serve");
    println!("Root: {}", dir.display());
    println!("URL:  http://localhost:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    info!("shutting down render engine");
    tokio::task::spawn_blocking(move || engine.close())
        .await
        .context("close task failed")??;
    Ok(())
}

/// Serves `GET /{view}` for every compiled view, with props from `?props=`.
/// View names are matched after percent-decoding.
fn pages_route(engine: &Arc<RenderEngine>, pages: HashMap<String, ViewRef>) -> MethodRouter {
    let engine = Arc::clone(engine);
    let pages = Arc::new(pages);
    get(
        move |AxumPath(name): AxumPath<String>,
              Query(query): Query<HashMap<String, String>>| {
            let engine = Arc::clone(&engine);
            let view = pages.get(&name).cloned();
            async move {
                let Some(view) = view else {
                    return (StatusCode::NOT_FOUND, format!("wx: no view named {name:?}"))
                        .into_response();
                };
                let raw = query.get("props").map(String::as_str).unwrap_or_default();
                match parse_props(raw) {
                    Ok(props) => render_view(engine, view, props).await,
                    Err(message) => (StatusCode::BAD_REQUEST, message).into_response(),
                }
            }
        },
    )
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_with_defaults() {
        let cli = Cli::try_parse_from(["wx", "build"]).expect("parse");
        assert_eq!(
            cli.command,
            Command::Build {
                dir: PathBuf::from("."),
                out: None
            }
        );

        let cli = Cli::try_parse_from(["wx", "serve", "--dir", "app", "--port", "3000"])
            .expect("parse");
        assert_eq!(
            cli.command,
            Command::Serve {
                dir: PathBuf::from("app"),
                port: 3000
            }
        );

        let cli = Cli::try_parse_from(["wx", "build", "-d", "app", "-o", "gen.rs"]).expect("parse");
        assert_eq!(
            cli.command,
            Command::Build {
                dir: PathBuf::from("app"),
                out: Some(PathBuf::from("gen.rs"))
            }
        );

        assert!(Cli::try_parse_from(["wx", "init"]).is_err(), "init needs a directory");
        assert!(Cli::try_parse_from(["wx", "deploy"]).is_err());
    }

    #[test]
    fn init_scaffolds_a_loadable_app() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("hello");
        init(&dir).expect("init");

        assert!(dir.join("views").join("Welcome.svelte").is_file());
        let config = WxConfig::load(&dir).expect("template config parses");
        assert_eq!(config, WxConfig::default());

        let err = init(&dir).expect_err("existing dir");
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn write_views_emits_generated_module() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let out = tmp.path().join("app.wx.rs");
        let views = vec![CompiledView::new(
            "Welcome",
            b"dom".to_vec(),
            b"ssr".to_vec(),
            b"css".to_vec(),
        )];
        write_views(&views, &out).expect("write");
        let source = fs::read_to_string(&out).expect("read");
        assert!(source.contains("pub static WELCOME_VIEW"));
        assert!(source.contains("pub fn views() -> Vec<ViewRef>"));
    }

    #[tokio::test]
    async fn pages_route_decodes_names_and_validates_props() {
        use axum::body::Body;
        use axum::http::Request;
        use http_body_util::BodyExt;
        use tower::ServiceExt;
        use wx_core::testing::{Probe, TemplateVmFactory};

        let engine = Arc::new(RenderEngine::new(Arc::new(TemplateVmFactory::new(
            Probe::new(),
        ))));
        let card: ViewRef = Arc::new(CompiledView::new(
            "My Card",
            Vec::new(),
            b"html: <p>{count}</p>".to_vec(),
            Vec::new(),
        ));
        engine.register_views([Arc::clone(&card)]).expect("register");
        let pages = HashMap::from([(card.name().to_string(), card)]);
        let app = axum::Router::new().route("/{view}", pages_route(&engine, pages));

        let get = |uri: &str| {
            let app = app.clone();
            let request = Request::builder().uri(uri).body(Body::empty()).expect("request");
            async move {
                let response = app.oneshot(request).await.expect("response");
                let status = response.status();
                let body = response.into_body().collect().await.expect("body").to_bytes();
                (status, String::from_utf8_lossy(&body).into_owned())
            }
        };

        let (status, body) = get("/My%20Card?props=%7B%22count%22%3A7%7D").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<p>7</p>"));

        let (status, _) = get("/My%20Card?props=%5B1%5D").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get("/Missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
