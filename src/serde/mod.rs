pub mod ascii;
pub mod binary;
mod error;
pub mod schema;

pub use error::{Error, Result};
