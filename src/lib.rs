//! Finds out how much a storage path can really hold by filling it with
//! incompressible blocks until it refuses, then cleaning up after itself.
//!
//! Drivers hand a [`RunConfig`] to [`run`] (blocking) or to an [`Engine`]
//! (on a worker thread) and receive an ordered stream of [`ReportEvent`]s
//! ending in exactly one [`ReportEvent::Finished`].

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod garbage;
pub mod scratch;
pub mod units;

pub use config::{BlockBudget, RunConfig, DEFAULT_BLOCK_SIZE};
pub use engine::{run, CancelToken, Engine, EventStream, Polled, Run, RunHandle};
pub use error::{CleanupError, EngineError, EngineResult, FailureKind, WriteFailure};
pub use event::{CleanupOutcome, ReportEvent, RunStatus, RunSummary};
pub use scratch::{BlockStore, ScratchDir};
