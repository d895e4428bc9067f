#[macro_use]

mod log;

pub use log::error::LogError;
pub use log::fmt::{LogFmt, LogFmtBuilder, LogSpec, SegmentSpec, Record};

pub type Result<T> = core::result::Result<T, LogError>;

pub use log::*;
