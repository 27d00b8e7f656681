pub mod file;
pub mod memory;

pub use file::FileStatePersistence;
pub use memory::InMemoryPersistence;
