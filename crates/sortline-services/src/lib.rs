//! sortline-services: the per-parcel decision-and-execution core and
//! EMC reset coordination. No sockets, no process-level state; the
//! daemon wires these to real (or simulated) hardware and upstream.

pub mod congestion;
pub mod diverter;
pub mod emc;
pub mod health;
pub mod load;
pub mod orchestrator;
pub mod overload;
pub mod path_executor;
pub mod pipeline;
pub mod selection;
pub mod throttle;
pub mod topology;
pub mod trace;
pub mod upstream;

pub use congestion::{CongestionDetector, CongestionSource};
pub use diverter::{DiverterController, DiverterLookup, DiverterTable, DriverError};
pub use emc::{
    CardAvailability, EmcHardware, EmcLockTransport, EmcPeer, EmcResetCoordinator, HardwareError,
    LocalLockHub, LockError, ResetError, ResetKind,
};
pub use health::{NodeHealthChecker, NodeHealthRegistry, NodeHealthReport};
pub use load::{LineLoadCollector, LoadTotals, NoopMetrics, SortingMetrics};
pub use orchestrator::{
    Collaborators, CompletionCallback, ParcelCompletion, SortOutcome, SortingOrchestrator, UpstreamLink,
};
pub use overload::{OverloadContext, OverloadDecision, OverloadPolicy, OverloadReason};
pub use path_executor::{PathExecutionResult, PathExecutor, SegmentFailure, SegmentFailureKind};
pub use pipeline::{ExceptionKind, SortingContext, SortingPipeline, SortingStage};
pub use selection::{ChuteSelector, PendingAssignments, ResolveOutcome, SelectionRequest, SelectionResult};
pub use throttle::{ReleaseDecision, ReleaseThrottle};
pub use topology::{PathGenerator, TopologyPathGenerator};
pub use trace::{MemoryTraceSink, TraceRecord, TraceSampler, TraceSink, TracingTraceSink};
pub use upstream::{ChuteAssignment, UpstreamClient, UpstreamError};
