//! # Workflow Orchestration Engine
//!
//! A backend-agnostic engine that plans scientific-workflow submissions
//! as a directed acyclic graph of task invocations and dispatches each
//! task (or scatter shard) to a pluggable execution backend, with
//! durable state, metadata, and result caching.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Supervisor                             │
//! │  (admits submissions, global concurrency, shutdown)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Workflow state machine                       │
//! │  (task graph, ready-node detection, restart)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//!         Call state       Scatter         Cache Index
//!         machine          Expander       (fingerprint lookaside)
//!              │
//!              ▼
//!     Backend Contract (local shell, batch, cloud pipelines, ...)
//! ```
//!
//! Persistence (`workflow`/`call`/`execution_info` rows) and the
//! metadata event stream sit underneath every state transition; the
//! Path & IO capability and the retry/circuit-breaker reliability
//! primitives are used throughout.
//!
//! ## Example
//!
//! ```ignore
//! use dagrunner_engine::prelude::*;
//!
//! let (supervisor, _metadata_rx) = Supervisor::new(
//!     SupervisorConfig::default(),
//!     persistence,
//!     cache,
//!     backends,
//!     io,
//! );
//! let status = supervisor.submit(workflow, graph, "local").await?;
//! ```

pub mod backend;
pub mod bench;
pub mod cache;
pub mod call;
pub mod config;
pub mod error;
pub mod http;
pub mod io;
pub mod metadata;
pub mod model;
pub mod persistence;
pub mod reliability;
pub mod scatter;
pub mod supervisor;
pub mod telemetry;
pub mod workflow;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::backend::{
        BackendContract, BackendError, BoundCall, CallOutcomeDetail, ExecutionHandle, InitData,
        LocalShellBackend, PollOutcome, RetryabilityHint,
    };
    pub use crate::cache::{
        CacheIndex, CacheIndexError, Fingerprint, HitStrategy, InMemoryCacheIndex, PriorResult,
    };
    pub use crate::call::{Call, CallOutcomeVerdict, CallStatus, CallTransitionError, ReturnCodePolicy};
    pub use crate::config::{ConfigError, EngineConfig};
    pub use crate::error::{
        CacheError, CallError, EngineError, InitializationError, PersistenceError, ValidationError,
    };
    pub use crate::http::{router as http_router, ApiDoc, HttpError};
    pub use crate::io::{IoCapability, IoError, LocalIo, PathHandle};
    pub use crate::metadata::{MetadataEvent, MetadataPublisher};
    pub use crate::model::{
        CallKey, GraphNode, NodeKind, TaskGraph, Workflow, WorkflowId, WorkflowOptions,
        WorkflowStatus,
    };
    pub use crate::persistence::{
        ExecutionInfoWrite, InMemoryPersistence, PersistenceAdapter, PostgresPersistence, StoreError,
    };
    pub use crate::reliability::{CircuitBreaker, CircuitBreakerConfig, FailureKind, RetryPolicy};
    pub use crate::scatter::{CollectorStatus, ScatterGroup};
    pub use crate::supervisor::{Supervisor, SupervisorConfig, SupervisorError};
}

// Re-export key types at crate root.
pub use backend::{BackendContract, BackendError, LocalShellBackend};
pub use cache::{CacheIndex, Fingerprint, InMemoryCacheIndex};
pub use call::{Call, CallStatus};
pub use error::EngineError;
pub use io::{IoCapability, LocalIo};
pub use metadata::MetadataPublisher;
pub use model::{CallKey, TaskGraph, Workflow, WorkflowId, WorkflowStatus};
pub use persistence::{InMemoryPersistence, PersistenceAdapter, PostgresPersistence, StoreError};
pub use reliability::RetryPolicy;
pub use supervisor::{Supervisor, SupervisorConfig};
