//! Stateful incremental collection.
//!
//! [`StatefulCollector`] drives a [`Connector`] against an [`ApiClient`],
//! appends what it parses to a [`RawRecordSink`], and commits a
//! [`CheckpointState`] to a [`CheckpointStore`] only when the whole run
//! succeeds. [`SubTaskRunner`] runs collectors (wrapped in a
//! [`CollectSubTask`]) and any other unit of pipeline work as named
//! subtasks of a plugin.

pub mod api_client;
pub mod cancel;
pub mod checkpoint;
pub mod clock;
pub mod collect_task;
pub mod collector;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod params;
pub mod plugin;
pub mod run_guard;
pub mod sink;
pub mod subtask;

pub use api_client::{ApiClient, ApiError, ApiResponse, QueryParams};
pub use cancel::CancellationToken;
pub use checkpoint::{CheckpointState, CheckpointStore, MemoryCheckpointStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collect_task::CollectSubTask;
pub use collector::{CollectSummary, RunPlan, StatefulCollector};
pub use connector::{Connector, PageCursor, ParseError, QueryContext};
pub use error::{CollectError, Result};
pub use params::CollectionParams;
pub use plugin::{validate_names, DefinitionError, PluginDefinition};
pub use run_guard::{RunGuard, RunRegistry};
pub use sink::{MemoryRawSink, RawRecordSink};
pub use subtask::{SubTask, SubTaskContext, SubTaskMeta, SubTaskReport, SubTaskRunner};
