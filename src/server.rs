//! Non-blocking gRPC server shell: parses the CSI `--endpoint` URL,
//! binds a unix or tcp listener, and serves the Identity/Controller/Node
//! services until asked to stop. Grounded on
//! `driver/server.go`'s `NonBlockingGRPCServer` (`Start`/`Wait`/`Stop`/
//! `ForceStop`) translated from a goroutine-plus-waitgroup into a
//! tokio task plus a shutdown channel.

use std::path::PathBuf;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;
use tracing::info;

use crate::controller::ControllerService;
use crate::csi::controller_server::ControllerServer;
use crate::csi::identity_server::IdentityServer;
use crate::csi::node_server::NodeServer;
use crate::identity::IdentityService;
use crate::node::NodeService;

enum Endpoint {
    Unix(PathBuf),
    Tcp(std::net::SocketAddr),
}

fn parse_endpoint(endpoint: &str) -> Result<Endpoint, String> {
    if let Some(path) = endpoint.strip_prefix("unix://") {
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }
    if let Some(addr) = endpoint.strip_prefix("tcp://") {
        return addr
            .parse()
            .map(Endpoint::Tcp)
            .map_err(|e| format!("invalid tcp address {addr}: {e}"));
    }
    Err(format!(
        "unsupported endpoint scheme (expected unix:// or tcp://): {endpoint}"
    ))
}

/// A gRPC server that runs on a background task, independent of the
/// caller's control flow. `stop`/`force_stop` mirror the teacher's
/// graceful-then-forceful shutdown pair.
pub struct NonBlockingGrpcServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl NonBlockingGrpcServer {
    pub async fn start(
        endpoint: &str,
        identity: IdentityService,
        controller: ControllerService,
        node: NodeService,
    ) -> Result<Self, String> {
        let endpoint = parse_endpoint(endpoint)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = match endpoint {
            Endpoint::Unix(path) => {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(format!("failed to remove stale socket {}: {e}", path.display())),
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
                }
                let listener = UnixListener::bind(&path)
                    .map_err(|e| format!("failed to bind {}: {e}", path.display()))?;
                info!(path = %path.display(), scheme = "unix", "listening for connections");
                let incoming = UnixListenerStream::new(listener);

                let router = Server::builder()
                    .add_service(IdentityServer::new(identity))
                    .add_service(ControllerServer::new(controller))
                    .add_service(NodeServer::new(node));

                tokio::spawn(async move {
                    if let Err(e) = router
                        .serve_with_incoming_shutdown(incoming, async {
                            let _ = shutdown_rx.await;
                        })
                        .await
                    {
                        tracing::error!(error = %e, "grpc server exited with error");
                    }
                })
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| format!("failed to bind {addr}: {e}"))?;
                info!(%addr, scheme = "tcp", "listening for connections");
                let incoming = TcpListenerStream::new(listener);

                let router = Server::builder()
                    .add_service(IdentityServer::new(identity))
                    .add_service(ControllerServer::new(controller))
                    .add_service(NodeServer::new(node));

                tokio::spawn(async move {
                    if let Err(e) = router
                        .serve_with_incoming_shutdown(incoming, async {
                            let _ = shutdown_rx.await;
                        })
                        .await
                    {
                        tracing::error!(error = %e, "grpc server exited with error");
                    }
                })
            }
        };

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    /// Waits for the server task to finish. Blocks until `stop` or
    /// `force_stop` is called (or the task panics).
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Signals the serve loop to finish accepting new connections and
    /// drain in-flight ones. Unlike `ForceStop` this does not abort the
    /// task.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn force_stop(&mut self) {
        self.stop();
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_endpoint() {
        match parse_endpoint("unix:///var/run/csi.sock").unwrap() {
            Endpoint::Unix(path) => assert_eq!(path, PathBuf::from("/var/run/csi.sock")),
            _ => panic!("expected unix endpoint"),
        }
    }

    #[test]
    fn parses_tcp_endpoint() {
        match parse_endpoint("tcp://127.0.0.1:9000").unwrap() {
            Endpoint::Tcp(addr) => assert_eq!(addr.port(), 9000),
            _ => panic!("expected tcp endpoint"),
        }
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_endpoint("http://127.0.0.1:9000").is_err());
    }
}
