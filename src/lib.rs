// Library interface for the relay binary and tests

// Declare all modules
pub mod clock;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod hub;
pub mod metadata;
pub mod publisher;
pub mod relay;
pub mod resolver;
pub mod schedule;
pub mod server;
pub mod supervisor;
pub mod transcoder;

pub use config::RelayConfig;
pub use metadata::ResolvedMetadata;
pub use resolver::{ProgramResolver, ResolvedProgram};
