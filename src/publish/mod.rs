// src/publish/mod.rs

pub mod event;
pub mod hec;
pub mod offset;
pub mod pool;
pub mod sink;
pub mod transform;

pub use event::{Event, FieldValue, Fields};
pub use hec::HecClient;
pub use pool::Publisher;
pub use sink::{DryRunSink, Sink, SinkError};
pub use transform::{EventTransformer, TransformError};
