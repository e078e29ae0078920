//! Non-Blocking Protocol Server
//!
//! Implements the start/graceful-stop/force-stop/wait lifecycle of the CSI
//! endpoint. `start` returns once the endpoint is bound; accepting and
//! serving happen on background tasks.

use crate::domain::ports::{ProtocolService, ServiceLifecycle};
use crate::driver::metrics::ProtocolMetrics;
use crate::error::{Error, Result};
use crate::grpc::endpoint::{Endpoint, Listener};
use crate::grpc::transport::{serve_connection, Router};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, debug_span, info, info_span, warn, Instrument};

/// Protocol server running in the background
pub struct NonBlockingServer {
    started: AtomicBool,
    /// Accept loop and connection tasks
    tracker: TaskTracker,
    /// Stops the accept loop
    stop_accepting: CancellationToken,
    /// Asks connections to finish in-flight calls and close
    graceful: CancellationToken,
    /// Drops connections immediately
    force: CancellationToken,
}

impl Default for NonBlockingServer {
    fn default() -> Self {
        Self::new()
    }
}

impl NonBlockingServer {
    pub fn new() -> Self {
        let tracker = TaskTracker::new();
        // Nothing is tracked yet, so waiting on a server that never started
        // returns at once.
        tracker.close();

        Self {
            started: AtomicBool::new(false),
            tracker,
            stop_accepting: CancellationToken::new(),
            graceful: CancellationToken::new(),
            force: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl ServiceLifecycle for NonBlockingServer {
    async fn start(
        &self,
        token: &CancellationToken,
        endpoint: &str,
        node_id: &str,
        metrics: ProtocolMetrics,
        services: Vec<Arc<dyn ProtocolService>>,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let endpoint: Endpoint = endpoint.parse()?;
        let listener = endpoint.listen().await?;
        let router = Arc::new(Router::new(services, metrics));

        let span = info_span!("csi_server", endpoint = %endpoint, node = node_id);
        self.tracker.spawn(
            accept_loop(
                listener,
                router,
                self.tracker.clone(),
                self.stop_accepting.clone(),
                self.graceful.clone(),
                self.force.clone(),
            )
            .instrument(span),
        );

        info!(endpoint = %endpoint, "Listening for connections");
        Ok(())
    }

    fn stop(&self) {
        self.stop_accepting.cancel();
        self.graceful.cancel();
    }

    fn force_stop(&self) {
        self.stop_accepting.cancel();
        self.force.cancel();
    }

    async fn wait(&self) {
        self.tracker.wait().await;
    }
}

async fn accept_loop(
    listener: Listener,
    router: Arc<Router>,
    tracker: TaskTracker,
    stop_accepting: CancellationToken,
    graceful: CancellationToken,
    force: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop_accepting.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((conn, peer)) => {
                let router = router.clone();
                let graceful = graceful.clone();
                let force = force.clone();
                tracker.spawn(
                    async move {
                        tokio::select! {
                            _ = force.cancelled() => debug!("Connection aborted"),
                            result = serve_connection(conn, router, graceful) => {
                                if let Err(e) = result {
                                    debug!(error = %e, "Connection failed");
                                }
                            }
                        }
                    }
                    .instrument(debug_span!("connection", peer = %peer)),
                );
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    listener.close();
    debug!("Stopped accepting connections");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::IdentityServer;
    use crate::domain::ports::Status;
    use assert_matches::assert_matches;
    use hyper::{Body, Request};
    use serde_json::Value;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio_test::{assert_pending, assert_ready};

    /// Service whose `Slow` method takes 200ms and whose `Hang` never returns
    struct SlowService;

    #[async_trait]
    impl ProtocolService for SlowService {
        fn name(&self) -> &'static str {
            "test.Slow"
        }

        async fn call(&self, method: &str, _request: Value) -> std::result::Result<Value, Status> {
            match method {
                "Slow" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(Value::from("done"))
                }
                "Hang" => futures::future::pending().await,
                other => Err(Status::unimplemented(self.name(), other)),
            }
        }
    }

    fn services() -> Vec<Arc<dyn ProtocolService>> {
        vec![
            Arc::new(IdentityServer::new("pmem-csi.intel.com", "v1")),
            Arc::new(SlowService),
        ]
    }

    fn metrics() -> ProtocolMetrics {
        ProtocolMetrics::new("pmem-csi.intel.com").unwrap()
    }

    async fn call(socket: &Path, method: &str) -> hyper::Result<hyper::StatusCode> {
        let stream = tokio::net::UnixStream::connect(socket).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::handshake(stream).await?;
        tokio::spawn(conn);
        let request = Request::post(method)
            .header(hyper::header::HOST, "localhost")
            .body(Body::from("{}"))
            .unwrap();
        Ok(sender.send_request(request).await?.status())
    }

    async fn started(tmp: &TempDir) -> (NonBlockingServer, std::path::PathBuf) {
        let socket = tmp.path().join("csi.sock");
        let server = NonBlockingServer::new();
        server
            .start(
                &CancellationToken::new(),
                &format!("unix://{}", socket.display()),
                "worker-1",
                metrics(),
                services(),
            )
            .await
            .unwrap();
        (server, socket)
    }

    #[tokio::test]
    async fn test_wait_without_start_returns_immediately() {
        let server = NonBlockingServer::new();
        let mut wait = tokio_test::task::spawn(server.wait());
        assert_ready!(wait.poll());
    }

    #[tokio::test]
    async fn test_serve_then_graceful_stop() {
        let tmp = TempDir::new().unwrap();
        let (server, socket) = started(&tmp).await;

        let status = call(&socket, "/csi.v1.Identity/Probe").await.unwrap();
        assert_eq!(status, hyper::StatusCode::OK);

        {
            let mut wait = tokio_test::task::spawn(server.wait());
            assert_pending!(wait.poll());
        }

        server.stop();
        tokio::time::timeout(Duration::from_secs(5), server.wait())
            .await
            .unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_graceful_stop_finishes_in_flight_call() {
        let tmp = TempDir::new().unwrap();
        let (server, socket) = started(&tmp).await;

        let in_flight = tokio::spawn(async move { call(&socket, "/test.Slow/Slow").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop();
        server.wait().await;
        let status = in_flight.await.unwrap().unwrap();
        assert_eq!(status, hyper::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_force_stop_aborts_in_flight_call() {
        let tmp = TempDir::new().unwrap();
        let (server, socket) = started(&tmp).await;

        let in_flight = tokio::spawn(async move { call(&socket, "/test.Slow/Hang").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.force_stop();
        server.force_stop();
        tokio::time::timeout(Duration::from_secs(5), server.wait())
            .await
            .unwrap();
        assert!(in_flight.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let tmp = TempDir::new().unwrap();
        let (server, socket) = started(&tmp).await;

        let err = server
            .start(
                &CancellationToken::new(),
                &format!("unix://{}", socket.display()),
                "worker-1",
                metrics(),
                services(),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::AlreadyStarted);
        server.force_stop();
        server.wait().await;
    }

    #[tokio::test]
    async fn test_start_on_cancelled_token_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let server = NonBlockingServer::new();
        let err = server
            .start(
                &token,
                &format!("unix://{}", tmp.path().join("csi.sock").display()),
                "worker-1",
                metrics(),
                services(),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled);
    }
}
