//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `UpdateTransformer`: Raw change-stream rows to normalized updates
//! - `FlowController`: Per-key debounce, throttle and batching
//! - `OfflineQueue`: Replay buffer for updates produced while offline
//! - `ReconnectPolicy`: Exponential backoff for channel re-establishment
//! - `ProgressSync`: The client facade tying them together
//! - `diagnostics`: Statistics and the composite health verdict

pub mod diagnostics;
pub mod flow_control;
pub mod offline_queue;
pub mod reconnect;
pub mod sync;
pub mod transform;

pub use diagnostics::{HealthReport, HealthStatus, SyncStats};
pub use flow_control::{BatchConfig, FlowControlConfig, FlowController};
pub use offline_queue::{OfflineQueue, OfflineQueueConfig, QueuePriority};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use sync::{DrainReport, ProgressCallback, ProgressSync, SubscriptionHandle, SyncError, SyncSettings};
pub use transform::{TransformError, Transformed, UpdateTransformer};
