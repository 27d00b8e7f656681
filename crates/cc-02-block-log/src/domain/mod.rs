pub mod entry;
pub mod errors;

pub use entry::{BlockLogCompression, PreparedEntry};
pub use errors::{BlockLogError, Result};
