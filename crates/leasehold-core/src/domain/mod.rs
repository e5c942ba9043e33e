//! Domain model (IDs, envelopes, result records).

pub mod envelope;
pub mod ids;
pub mod result;

pub use envelope::{
    DEFAULT_CONTENT_ENCODING, DEFAULT_CONTENT_TYPE, DeliveryInfo, Envelope, LeaseHandle,
    TaskRequest,
};
pub use ids::{Id, IdMarker, JobId, MessageId, ReceiptHandle};
pub use result::{ResultMetadata, ResultRecord, TaskStatus};
