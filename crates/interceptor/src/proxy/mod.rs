pub mod capture;
pub mod engine;
pub mod error;
pub mod retry;
pub mod rotation;
mod server;
pub mod streaming;
pub mod upstream;

pub use capture::{InterceptedRequest, RequestState, StreamDelta, TokenUsage};
pub use engine::{Engine, InboundRequest};
pub use error::{FailureKind, UpstreamFailure, create_error_response};
pub use retry::BackoffPolicy;
pub use rotation::{RotationState, Rotator, Selection};
pub use server::{AppState, ProxyServer, create_router, shutdown_signal};
pub use streaming::{FinalRecord, IncrementalUpdate, StreamAccumulator, StreamFormat, Termination};
pub use upstream::{UpstreamClient, UpstreamRequest, UpstreamResponse};
