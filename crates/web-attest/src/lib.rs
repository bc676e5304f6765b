//! web-attest: capture browser session state and turn request templates into
//! fully resolved requests ready for notarization.

pub mod builder;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod extract;
pub mod fetch;
pub mod host;
pub mod manifest;
pub mod prepare;
pub mod prover;

pub use builder::{BuilderStage, ManifestSource, RequestBuilder};
pub use capture::{CaptureSession, CapturedArtifacts, SessionState};
pub use config::{PipelineConfig, RedeliveryPolicy};
pub use error::{AttestError, AttestResult, ExtractionReason};
pub use events::{EventBus, EventEnvelope, PipelineEvent};
pub use fetch::ResourceFetcher;
pub use host::{BrowserHost, CookieRecord, HostCapability, HostSurface, RawCapture, SurfaceTarget};
pub use manifest::{Manifest, Method, Mode, RequestTemplate, ResponseTemplate, VariableRule};
pub use prepare::PreparationScript;
pub use prover::{ProofOrchestrator, ProofRequest, ProofResult, ProofStatus, Prover, ProverError};
