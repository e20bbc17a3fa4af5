pub mod backend;
pub mod config;
pub mod counter;
pub mod error;
pub mod instance;
pub mod measurement;
pub mod profiler;
pub mod records;
pub mod reduction;
pub mod remote;
pub mod runtime;
pub mod serde;
pub mod serialize;
pub mod serializer;
pub mod sim;
pub mod state;
