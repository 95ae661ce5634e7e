//! Monitoring Module
//!
//! Live lifecycle events and step timing for running executions.
//!
//! # Components
//!
//! - [`EventBroadcaster`]: per-execution pub/sub with history replay
//! - [`StreamEvent`]: the event wire shape
//! - [`ExecutionTimeline`]: step start/end timing for Gantt charts

pub mod broadcaster;
pub mod events;
pub mod timeline;

pub use broadcaster::{EventBroadcaster, Subscription};
pub use events::{EventKind, StreamEvent};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
