//! Record types and the partitioned record batch store.

mod batch_store;
mod model;

pub use batch_store::{BatchFile, BatchStore, RecordBatch};
pub use model::{
    Category, ConfidenceMap, Detection, DetectionResult, RawRecord, Record,
};
