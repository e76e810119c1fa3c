//! Minimal HTTP endpoint exposing `/metrics` for Prometheus scrapes.

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics;

async fn handle(request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let response = match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => match metrics::gather_text() {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(Body::from(body))
                .expect("building metrics response cannot fail"),
            Err(e) => Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from(format!("{e:#}")))
                .expect("building error response cannot fail"),
        },
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .expect("building 404 response cannot fail"),
    };
    Ok(response)
}

/// Serve `/metrics` until the cancellation token fires.
pub async fn serve_metrics(port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = hyper::Server::try_bind(&addr)
        .with_context(|| format!("binding metrics endpoint on {addr}"))?
        .serve(make_svc);
    info!("serving metrics on http://{addr}/metrics");
    server
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("metrics endpoint failed")
}
