pub mod item;
pub mod report;
pub mod request;
pub mod result;

pub use item::{BatchItem, IllegalTransition, ItemStatus};
pub use report::{write_report, BatchReport, BatchSummary};
pub use request::{GenerationRequest, RequestError, MAX_IMAGE_COUNT, MIN_IMAGE_COUNT};
pub use result::{FailureReason, GeneratedImage, GenerationFailure, GenerationResult};
