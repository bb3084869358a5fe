pub mod segment;
pub mod stream_log;

pub use stream_log::StreamLog;
