//! multiping - ping several hosts side by side.
//!
//! One probe session per slot, each feeding a parser, running statistics and
//! a per-run log file, coordinated by a supervisor.

pub mod config;
pub mod events;
pub mod preset;
pub mod probe;
pub mod session;
pub mod supervisor;

pub use config::AppConfig;
pub use events::SupervisorEvent;
pub use preset::Preset;
pub use session::{ProbeSession, SessionError, SessionSnapshot, SessionState};
pub use supervisor::{SessionSupervisor, SupervisorError};
