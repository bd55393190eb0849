//! HTTP front end: admission middleware, routes and server.

pub mod handlers;
mod middleware;
mod server;

pub use handlers::{ErrorDetail, ErrorEnvelope};
pub use middleware::{
    admit, client_key, rejection_response, AdmissionState, ClientIp, KeyFn, RATE_LIMITED_CODE,
};
pub use server::HttpServer;
