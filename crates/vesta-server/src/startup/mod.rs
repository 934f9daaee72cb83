//! Server startup: logging, engine wiring, HTTP server and shutdown

pub mod engine;
pub mod http;
pub mod logging;
pub mod shutdown;

pub use engine::{Engine, EngineSettings};
pub use http::main_server;
pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{ShutdownSignal, listen_for_os_signals};
