// cmdexec Infrastructure - System Adapters
// Implements: ProcessRunner, ProcessControl, EventSink (HTTP)

pub mod http_sink;
pub mod process_control;
pub mod process_runner;
pub mod signals;

pub use http_sink::HttpEventSink;
pub use process_control::UnixProcessControl;
pub use process_runner::TokioProcessRunner;
