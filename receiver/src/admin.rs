//! Admin HTTP server for health checks and metrics

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;

use crate::telemetry::encode_metrics;

/// Serve /healthz and /metrics on `addr` until `cancel` fires.
pub async fn serve_admin(
    addr: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move { Ok::<_, Infallible>(handle(&req, &registry)) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    tracing::info!("Admin HTTP server listening on {}", server.local_addr());
    server
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

fn handle(req: &Request<Body>, registry: &Registry) -> Response<Body> {
    match req.uri().path() {
        "/healthz" => Response::new(Body::from("ok\n")),
        "/metrics" => {
            let mut response = Response::new(Body::from(encode_metrics(registry)));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        _ => {
            let mut response = Response::new(Body::from("not found\n"));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}
