//! Session lifecycle and registry for agent sessions.
//!
//! Provides:
//! - `Session` - Binds one event log, one control loop and one execution
//!   gateway to one logical task, and owns their combined lifecycle
//! - `SessionRegistry` - Explicit registry with sandbox-capacity accounting
//!   and an idle-timeout sweep

pub mod registry;
pub mod session;

pub use registry::{RegistryConfig, SessionRegistry};
pub use session::{AttachMode, ReplayHandle, Session, SessionConfig, SessionError, TaskSpec};
