//! Execution gateway and sandbox transport for agent actions.
//!
//! Provides:
//! - `SandboxTransport` - Request/response RPC surface to an execution process
//! - `ExecutionGateway` - Turns an Action into an Observation with
//!   timeout-as-data semantics and bounded transport reconnects
//! - `LocalSandbox` - In-process transport for local and test use
//! - `SandboxPool` - Bounded leasing of sandbox capacity

pub mod gateway;
pub mod local;
pub mod pool;
pub mod transport;

pub use gateway::{ExecutionGateway, GatewayConfig, GatewayError};
pub use local::{LocalSandbox, LocalSandboxConfig, LocalSandboxProvider};
pub use pool::{PoolError, SandboxLease, SandboxPool};
pub use transport::{SandboxProvider, SandboxRequest, SandboxResponse, SandboxTransport, TransportError};
