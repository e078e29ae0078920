//! HTTPS Endpoint Supervisor
//!
//! Common logic for starting and stopping an HTTP endpoint whose lifetime is
//! linked to the driver's cancellation token in both directions:
//! - if serving ends for any reason other than an explicit close, the token
//!   is cancelled and the whole driver shuts down
//! - once the token is cancelled, the server is closed
//!
//! Either trigger may fire first. Both are idempotent, so no lock is needed.
//!
//! TLS is not configured yet; the endpoint serves plaintext.

use crate::error::{Error, Result};
use futures::Future;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info_span, warn, Instrument};

/// Bind `listen` and serve `handler` until `token` is cancelled.
///
/// Returns the bound address, which differs from `listen` when that asks
/// for port 0 or omits the host. Closing the endpoint also drops open
/// keep-alive connections.
pub async fn start_https_server<H>(
    token: &CancellationToken,
    listen: &str,
    handler: H,
) -> Result<SocketAddr>
where
    H: Fn(Request<Body>) -> Response<Body> + Send + Sync + 'static,
{
    let bind_addr = normalize_listen(listen);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|source| Error::Listen {
            addr: listen.to_string(),
            source,
        })?;
    let addr = listener.local_addr()?;

    let closed = CancellationToken::new();
    let serve = accept_loop(listener, Arc::new(handler), closed.clone());
    supervise(token.clone(), closed, listen, serve);

    debug!(listen, %addr, "HTTP server started");
    Ok(addr)
}

async fn accept_loop<H>(
    listener: TcpListener,
    handler: Arc<H>,
    closed: CancellationToken,
) -> Result<()>
where
    H: Fn(Request<Body>) -> Response<Body> + Send + Sync + 'static,
{
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let handler = handler.clone();
        let service = service_fn(move |req: Request<Body>| {
            debug!(
                method = %req.method(),
                path = req.uri().path(),
                agent = ?req.headers().get(hyper::header::USER_AGENT),
                "Handling request"
            );
            let response = handler(req);
            async move { Ok::<_, Infallible>(response) }
        });

        let closed = closed.clone();
        tokio::spawn(
            async move {
                let conn = Http::new().serve_connection(stream, service);
                tokio::select! {
                    _ = closed.cancelled() => debug!("Connection dropped on close"),
                    result = conn => {
                        if let Err(e) = result {
                            debug!(error = %e, "Connection failed");
                        }
                    }
                }
            }
            .instrument(debug_span!("metrics_connection", peer = %peer)),
        );
    }
}

/// Run `serve` in the background, linked to `token` in both directions.
///
/// `closed` is cancelled once `token` is, and `serve` is dropped then.
pub(crate) fn supervise<F>(
    token: CancellationToken,
    closed: CancellationToken,
    listen: &str,
    serve: F,
) where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let span = info_span!("http_server", listen = %listen);

    let serve_closed = closed.clone();
    let serve_token = token.clone();
    tokio::spawn(
        async move {
            tokio::select! {
                biased;
                _ = serve_closed.cancelled() => {
                    debug!("Closed");
                }
                result = serve => {
                    match result {
                        Ok(()) => error!("Stopped unexpectedly"),
                        Err(e) => error!(error = %e, "Failed"),
                    }
                    // Also stop the main flow.
                    serve_token.cancel();
                }
            }
        }
        .instrument(span),
    );

    tokio::spawn(async move {
        token.cancelled().await;
        closed.cancel();
    });
}

/// Accept Go-style `:port` listen addresses
fn normalize_listen(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn ok_handler(_req: Request<Body>) -> Response<Body> {
        Response::new(Body::from("ok"))
    }

    async fn wait_refused(addr: SocketAddr) -> bool {
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(addr).await.is_err() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_normalize_listen() {
        assert_eq!(normalize_listen(":9090"), "0.0.0.0:9090");
        assert_eq!(normalize_listen("127.0.0.1:0"), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_serves_and_closes_on_cancel() {
        let token = CancellationToken::new();
        let addr = start_https_server(&token, "127.0.0.1:0", ok_handler)
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);

        let client = hyper::Client::new();
        let uri: hyper::Uri = format!("http://{}/anything", addr).parse().unwrap();
        let response = client.get(uri).await.unwrap();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"ok");

        token.cancel();
        assert!(wait_refused(addr).await);
    }

    #[tokio::test]
    async fn test_cancel_drops_kept_alive_connections() {
        let token = CancellationToken::new();
        let addr = start_https_server(&token, "127.0.0.1:0", ok_handler)
            .await
            .unwrap();

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::handshake(stream).await.unwrap();
        let conn = tokio::spawn(conn);
        let get = || {
            Request::get("/metrics")
                .header(hyper::header::HOST, "localhost")
                .body(Body::empty())
                .unwrap()
        };

        let response = sender.send_request(get()).await.unwrap();
        assert_eq!(response.status(), hyper::StatusCode::OK);
        hyper::body::to_bytes(response.into_body()).await.unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), conn)
            .await
            .expect("connection should be closed by the server")
            .unwrap()
            .ok();
        assert!(sender.send_request(get()).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_startup_error() {
        let token = CancellationToken::new();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listen = taken.local_addr().unwrap().to_string();

        let err = start_https_server(&token, &listen, ok_handler)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Listen { addr, .. } if addr == listen);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_unexpected_failure_cancels_token() {
        let token = CancellationToken::new();
        supervise(token.clone(), CancellationToken::new(), "test", async {
            Err(Error::Internal("accept failed".into()))
        });

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token should be cancelled");
    }

    #[tokio::test]
    async fn test_unexpected_clean_exit_cancels_token() {
        let token = CancellationToken::new();
        supervise(token.clone(), CancellationToken::new(), "test", async { Ok(()) });

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token should be cancelled");
    }

    #[tokio::test]
    async fn test_external_cancel_closes_server() {
        let token = CancellationToken::new();
        let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel::<()>();

        supervise(token.clone(), CancellationToken::new(), "test", async move {
            // Dropping the future drops the sender.
            let _dropped = dropped_tx;
            futures::future::pending::<Result<()>>().await
        });

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), dropped_rx).await;
        assert_matches!(result, Ok(Err(_)));
    }
}
