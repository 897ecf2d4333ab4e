//! Middleware Pipeline — the ordered handler chain the server runs every
//! request through:
//! `[logRequest, findApplicationRoot, handleStaticRequest,
//! findRackApplication, handleApplicationRequest, errorRenderer]`.
//!
//! Each non-error handler takes `(req, res, next)` and either defers, jumps
//! to the error slot, or writes a response. That dispatch is represented
//! here as a fixed sequence of async steps rather than a dynamic list of
//! `{Normal, Error}` handlers — the chain's shape never changes at
//! runtime, so there is nothing gained by making the list itself
//! runtime-configurable; the only thing threaded dynamically between the
//! steps is the request annotation.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::Request;
use tracing::{info, info_span, Instrument};

use crate::errors::{html_escape, HandlerName, PowError};
use crate::host_router::{not_configured_body, HostRouter, RouteOutcome};
use crate::pauser::{self, Resume};

const X_POW_HANDLER: &str = "x-pow-handler";

/// The request annotation: `{host, root, application?, resume}`.
/// `root`/`application` are filled in as the chain progresses; `resume` is
/// installed by `find_application_root` and threaded through.
struct RequestContext {
    host: String,
    resume: Resume,
}

/// Errors that can reach the tail error slot: resolver failures and
/// application boot/pool failures render distinct pages; everything else
/// renders an opaque 500.
enum PipelineError {
    Resolver(PowError),
    Boot { root: String, err: Arc<PowError> },
}

/// The full chain wired together. Owns the Host Router and hands off to
/// `Application::handle` once a request has cleared the static fast path.
pub struct Pipeline {
    host_router: Arc<HostRouter>,
}

impl Pipeline {
    pub fn new(host_router: Arc<HostRouter>) -> Self {
        Self { host_router }
    }

    /// Exposed so the binary can call `close_all()` on shutdown without
    /// holding a second `Arc` to the same router.
    pub fn host_router(&self) -> &Arc<HostRouter> {
        &self.host_router
    }

    /// Run the full chain for one request, converting any error that
    /// reaches the tail into the documented error page rather than ever
    /// propagating out to the caller.
    pub async fn dispatch(&self, req: Request<Body>) -> Response {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let host = host_header(&req).unwrap_or_default();
        let request_id = uuid::Uuid::new_v4();
        let span = info_span!("request", %method, %uri, host = %host, %request_id);

        async move {
            match self.run(req, host).await {
                Ok(resp) => resp,
                Err(err) => render_error(err),
            }
        }
        .instrument(span)
        .await
    }

    /// `logRequest` through `handleApplicationRequest`.
    async fn run(&self, req: Request<Body>, host: String) -> Result<Response, PipelineError> {
        info!("request received");

        // `findApplicationRoot` takes a pause and installs the resume into
        // the request annotation.
        let (parts, body) = req.into_parts();
        let (paused, resume) = pauser::pause(body);
        let req = Request::from_parts(parts, Body::new(paused));
        let ctx = RequestContext { host, resume };

        let root = match self
            .host_router
            .route_for_host(&ctx.host)
            .await
            .map_err(PipelineError::Resolver)?
        {
            RouteOutcome::Root(root) => root,
            RouteOutcome::NotConfigured { suggested_symlink } => {
                // No application nor rack branch will run: release the
                // pause ourselves before answering.
                ctx.resume.resume();
                return Ok(not_configured_response(&suggested_symlink));
            }
        };

        // `handleStaticRequest`: GET/HEAD only; on no match, releases the
        // pause so the body reaches the rack branch intact.
        if matches!(req.method(), &Method::GET | &Method::HEAD) {
            let static_handler = self.host_router.static_handler_for_root(&root);
            match static_handler.serve(req.uri().path()) {
                Ok(file) => return Ok(static_response(req.method(), &file)),
                Err(_) => ctx.resume.resume(),
            }
        }

        // `findRackApplication` / `handleApplicationRequest`.
        let application = match self.host_router.application_for_root(&root).await {
            Some(app) => app,
            None => {
                ctx.resume.resume();
                return Ok(non_rack_response(&root));
            }
        };

        application
            .handle(req, ctx.resume)
            .await
            .map_err(|err| PipelineError::Boot {
                root: root.display().to_string(),
                err,
            })
    }
}

fn host_header(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `errorRenderer`: the tail of the chain every error from upstream
/// handlers is caught by.
fn render_error(err: PipelineError) -> Response {
    match err {
        PipelineError::Resolver(err) => {
            tracing::warn!(%err, "resolver error");
            (StatusCode::BAD_GATEWAY, "host resolver error").into_response()
        }
        PipelineError::Boot { root, err } => boot_failure_response(&root, &err),
    }
}

/// "No application for host": 503, `X-Pow-Handler: NonexistentDomain`,
/// body names the suggested symlink path.
fn not_configured_response(suggested_symlink: &str) -> Response {
    let body = not_configured_body(suggested_symlink);
    let mut resp = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
    set_handler_headers(&mut resp, HandlerName::NonexistentDomain);
    resp
}

/// "Application boot failure": 500, `X-Pow-Handler: ApplicationException`,
/// body names the HTML-escaped root, the error message, and (for script
/// errors) the captured stderr as a pseudo-trace.
fn boot_failure_response(root: &str, err: &PowError) -> Response {
    let body = format!(
        "<html><body><h1>Application failed to start</h1>\
         <p>Root: <code>{}</code></p><pre>{}</pre><pre>{}</pre></body></html>",
        html_escape(root),
        html_escape(&err.to_string()),
        html_escape(err.stderr()),
    );
    let mut resp = (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
    set_handler_headers(&mut resp, HandlerName::ApplicationException);
    resp
}

fn set_handler_headers(resp: &mut Response, handler: HandlerName) {
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf8"),
    );
    if let Ok(value) = HeaderValue::from_str(handler.as_str()) {
        resp.headers_mut()
            .insert(hyper::header::HeaderName::from_static(X_POW_HANDLER), value);
    }
}

/// A root whose `config.ru` has disappeared since it was last cached — the
/// root has ceased to be a rack-style app. Not one of the named error
/// pages — there is no documented status for this case, so it renders as
/// a plain 404 rather than guessing a handler name.
fn non_rack_response(root: &std::path::Path) -> Response {
    (
        StatusCode::NOT_FOUND,
        format!("no rack application at {}", html_escape(&root.display().to_string())),
    )
        .into_response()
}

fn static_response(method: &Method, file: &crate::static_files::CachedFile) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, file.content_type)
        .header(hyper::header::CONTENT_LENGTH, file.size.to_string());

    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(bytes::Bytes::copy_from_slice(file.as_bytes()))
    };

    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "static response build failed").into_response()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host_router::SymlinkHostResolver;
    use axum::body::Body;
    use http_body_util::BodyExt;

    fn pipeline(dir: &std::path::Path) -> Pipeline {
        let resolver = Arc::new(SymlinkHostResolver::new(dir.to_path_buf(), "dev".to_string()));
        let router = HostRouter::new(resolver, Arc::new(Config::default()));
        Pipeline::new(router)
    }

    #[tokio::test]
    async fn unknown_host_renders_nonexistent_domain_503() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = pipeline(dir.path());

        let req = Request::builder()
            .uri("/")
            .header("host", "bogus.dev")
            .body(Body::empty())
            .unwrap();

        let resp = pipe.dispatch(req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get(X_POW_HANDLER).unwrap(),
            "NonexistentDomain"
        );

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("bogus"));
    }

    #[tokio::test]
    async fn static_file_short_circuits_before_any_application_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("foo");
        let public_dir = app_dir.join("public");
        tokio::fs::create_dir_all(&public_dir).await.unwrap();
        tokio::fs::write(public_dir.join("favicon.ico"), b"ICO")
            .await
            .unwrap();
        // Deliberately no config.ru: proves the static fast path runs
        // before `findRackApplication`.
        let pipe = pipeline(dir.path());

        let req = Request::builder()
            .uri("/favicon.ico")
            .header("host", "foo.dev")
            .body(Body::empty())
            .unwrap();

        let resp = pipe.dispatch(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ICO");
    }

    #[tokio::test]
    async fn missing_config_ru_serves_as_non_rack_request() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("foo");
        tokio::fs::create_dir_all(&app_dir).await.unwrap();
        let pipe = pipeline(dir.path());

        let req = Request::builder()
            .uri("/")
            .header("host", "foo.dev")
            .body(Body::empty())
            .unwrap();

        let resp = pipe.dispatch(req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
