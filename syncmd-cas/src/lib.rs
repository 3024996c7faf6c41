pub mod atomic;
pub mod errors;
pub mod staging;
pub mod store;

pub use atomic::{is_temp_name, write_atomic, AtomicWriteResult, AtomicWriter};
pub use errors::{CasError, Result};
pub use staging::{StagedFile, StagingArea};
pub use store::{ContentStore, ObjectRef};
