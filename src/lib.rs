pub mod config;
pub mod error;
pub mod events;
pub mod lease;
pub mod run;
pub mod runtime;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{Result, RuntimeError};
pub use runtime::Runtime;
