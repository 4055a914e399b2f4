pub mod router;
pub mod sink;

pub use router::LogRouter;
pub use sink::{LogSink, DEFAULT_LOG_DATE_FORMAT};
