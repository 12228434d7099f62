//! gRPC server implementation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::admission_service_server::AdmissionServiceServer;
use super::service::AdmissionServiceImpl;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::AdmissionEngine;

/// gRPC server for the admission service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The engine behind every RPC
    engine: Arc<AdmissionEngine>,
    /// Rule file re-read by `ReloadRules` when no document is supplied
    rules_path: PathBuf,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, engine: Arc<AdmissionEngine>, rules_path: PathBuf) -> Self {
        Self {
            addr,
            engine,
            rules_path,
        }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AdmissionServiceImpl::new(self.engine, self.rules_path);

        info!(addr = %self.addr, "Starting gRPC server for AdmissionService");

        Server::builder()
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TurnstileError::Grpc(e)
            })
    }
}
