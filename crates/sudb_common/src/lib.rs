pub mod config;
pub mod error;
pub mod shutdown;
pub mod value;

pub use error::{ErrorKind, SudbError, SudbResult};
pub use value::{Row, StorageType};
