pub mod filter;
pub mod parser;
pub mod session;

pub use filter::LogFilter;
pub use parser::LogEntryParser;
pub use session::{LogcatRequest, LogcatSession};
