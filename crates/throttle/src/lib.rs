//! Adaptive client-side throttling for storage-service clients.
//!
//! Collaborators report every completed operation with its byte count and
//! outcome, and ask for the recommended pause before issuing the next one. A
//! background scheduler turns the recent mix of failed and successful traffic
//! into that pause, once per analysis period and independently per session and
//! direction.

/// Per-direction analyzers and the control law.
pub mod analyzer;

pub mod config;

/// Lock-free traffic accounting for the current analysis window.
pub mod counter;

mod error;

mod scheduler;

/// Session registry and collaborator facade.
pub mod service;

pub mod session;

#[cfg(feature = "trace")]
pub mod tracer;

pub use analyzer::{AnalysisSample, AnalyzerPhase, AnalyzerStats, ThrottlingAnalyzer};
pub use config::{ThrottleConfig, ThrottleConfigArgs};
pub use counter::{TrafficCounter, Window};
pub use error::{Result, ThrottleError};
pub use service::{
    AnalysisResult, DirectionMetrics, DirectionResult, SessionStats, ThrottleService,
    TrafficMetrics,
};
pub use session::{Direction, StorageSession};
