//! Client runtime: key cache, transport and submission flow.

pub mod key_cache;
pub mod orchestrator;
pub mod transport;

pub use key_cache::{ClientKeyCache, StorageKind};
pub use orchestrator::{ClientConfig, SubmissionOrchestrator, SubmissionState};
pub use transport::{HttpTransport, LoopbackTransport, Transport, TransportResponse};
