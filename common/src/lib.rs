pub mod build;
pub mod log;

pub use build::BuildState;
pub use log::{LogItem, LogStream};
