pub mod error;
pub mod seconds;

pub use error::{Error, Result};
pub use seconds::Seconds;
