//! gRPC surface for the admission engine.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::AdmissionServiceImpl;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("turnstile.admission.v1");
}

// Re-export commonly used types
pub use proto::{admission_service_server::AdmissionServiceServer, EvaluateRequest, EvaluateResponse};
