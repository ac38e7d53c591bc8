//! `reqflow` is an HTTP client orchestration layer: descriptors in, scheduled
//! operations out, with request mocking, etag capture and offline replay.
//!
//! # Quick Start
//!
//! ```no_run
//! use reqflow::prelude::{Client, ConcurrencyMode, RequestDescriptor};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Profile {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("https://api.example.com")
//!         .mode(ConcurrencyMode::bounded(4))
//!         .locale("en-GB")
//!         .try_build()?;
//!     client.authenticate_bearer("token-123")?;
//!
//!     let profile: Profile = client
//!         .get(RequestDescriptor::new("/v1/profile").revalidate(true))
//!         .await?
//!         .json()?;
//!     println!("hello {}", profile.name);
//!
//!     client
//!         .post(
//!             RequestDescriptor::new("/v1/events")
//!                 .json(&serde_json::json!({ "kind": "opened" }))?
//!                 .offline_retryable(),
//!         )
//!         .await
//!         .ok();
//!
//!     // Later, once connectivity is back:
//!     client.replay().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Execution Modes
//!
//! - `ExecutionMode::Live` always uses the transport.
//! - `ExecutionMode::PartialSimulation` answers from registered mocks when one
//!   matches the descriptor key and falls back to the transport otherwise.
//! - `ExecutionMode::ForcedSimulation` never touches the transport and fails
//!   with `Error::NoMockProvided` when no mock matches.

mod client;
mod config;
mod decorator;
mod descriptor;
mod error;
mod metrics;
mod mock;
mod mode;
mod pipeline;
mod replay;
mod request;
mod response;
mod scheduler;
mod selector;
mod store;
mod tls;
mod transport;
mod util;

pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{StatusPolicy, TransportConfig};
pub use crate::decorator::{ConnectivityClassifier, OfflineClassifier};
pub use crate::descriptor::{Parameters, RequestDescriptor, StorePolicy};
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::mock::{Mock, MockFailure, MockOutcome, MockResponse};
pub use crate::mode::{ConcurrencyMode, ExecutionMode};
pub use crate::pipeline::{BeforeEachHook, HeaderProvider, Middleware, PreProcessHook};
pub use crate::request::WireRequest;
pub use crate::response::Response;
pub use crate::store::{
    EtagStore, JsonLinesOfflineStore, MemoryEtagStore, MemoryOfflineStore, OfflineCapsule,
    OfflineStore,
};
pub use crate::tls::TrustPolicy;
pub use crate::transport::{HyperTransport, Transport, TransportResponse};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Client, ClientBuilder, ClientMetricsSnapshot, ConcurrencyMode, ConnectivityClassifier,
        EtagStore, Error, ErrorCode, ExecutionMode, JsonLinesOfflineStore, MemoryEtagStore,
        MemoryOfflineStore, Middleware, Mock, MockFailure, MockOutcome, MockResponse,
        OfflineCapsule, OfflineClassifier, OfflineStore, Parameters, RequestDescriptor, Response,
        Result, StatusPolicy, StorePolicy, Transport, TransportConfig, TransportErrorKind,
        TransportResponse, TrustPolicy, WireRequest,
    };
}
