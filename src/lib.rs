pub mod config;
pub mod environment;
pub mod errors;
pub mod history;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod source;
pub mod version;
