//! Request Transport
//!
//! Serves protocol calls over HTTP/1: `POST /<service>/<method>` with a JSON
//! request body, answered with a JSON response. Failed calls carry their
//! [`Status`] as the body. Every call is observed in [`ProtocolMetrics`].

use crate::domain::ports::{ProtocolService, Status, StatusCode};
use crate::driver::metrics::ProtocolMetrics;
use crate::error::Result;
use crate::grpc::endpoint::Connection;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Routes calls to the registered services
pub struct Router {
    services: HashMap<&'static str, Arc<dyn ProtocolService>>,
    metrics: ProtocolMetrics,
}

impl Router {
    pub fn new(services: Vec<Arc<dyn ProtocolService>>, metrics: ProtocolMetrics) -> Self {
        let services = services
            .into_iter()
            .map(|service| (service.name(), service))
            .collect();
        Self { services, metrics }
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        if req.method() != Method::POST {
            return respond(
                hyper::StatusCode::METHOD_NOT_ALLOWED,
                &Status::new(StatusCode::InvalidArgument, "calls must use POST"),
            );
        }

        let started = Instant::now();
        let result = self.dispatch(&path, req.into_body()).await;
        let code = match &result {
            Ok(_) => StatusCode::Ok,
            Err(status) => status.code,
        };
        self.metrics.record(&path, code, started.elapsed());

        match result {
            Ok(value) => {
                debug!(method = %path, "Call succeeded");
                respond(hyper::StatusCode::OK, &value)
            }
            Err(status) => {
                debug!(method = %path, code = %status.code, message = %status.message, "Call failed");
                respond(http_status(status.code), &status)
            }
        }
    }

    async fn dispatch(&self, path: &str, body: Body) -> std::result::Result<Value, Status> {
        let (service, method) = path
            .trim_start_matches('/')
            .split_once('/')
            .ok_or_else(|| Status::new(StatusCode::Unimplemented, format!("malformed method {:?}", path)))?;

        let bytes = hyper::body::to_bytes(body)
            .await
            .map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string()))?;
        let request = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string()))?
        };

        match self.services.get(service) {
            Some(svc) => svc.call(method, request).await,
            None => Err(Status::unimplemented(service, method)),
        }
    }
}

fn http_status(code: StatusCode) -> hyper::StatusCode {
    match code {
        StatusCode::Ok => hyper::StatusCode::OK,
        StatusCode::InvalidArgument => hyper::StatusCode::BAD_REQUEST,
        StatusCode::NotFound => hyper::StatusCode::NOT_FOUND,
        StatusCode::Unimplemented => hyper::StatusCode::NOT_IMPLEMENTED,
        StatusCode::Unavailable => hyper::StatusCode::SERVICE_UNAVAILABLE,
        StatusCode::Internal => hyper::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: serde::Serialize>(status: hyper::StatusCode, body: &T) -> Response<Body> {
    let bytes = match serde_json::to_vec(body) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to encode response");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
            return response;
        }
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Serve one connection until the peer closes it. Once `graceful` is
/// cancelled, in-flight calls finish and the connection is closed.
pub async fn serve_connection(
    io: Box<dyn Connection>,
    router: Arc<Router>,
    graceful: CancellationToken,
) -> Result<()> {
    let service = service_fn(move |req: Request<Body>| {
        let router = router.clone();
        async move { Ok::<_, Infallible>(router.handle(req).await) }
    });

    let conn = Http::new().serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result?,
        _ = graceful.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await?;
        }
    }
    Ok(())
}
