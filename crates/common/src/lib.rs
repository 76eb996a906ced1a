//! edharness Common Library
//!
//! Shared building blocks for driving a batch-mode editor from a test
//! harness: the JSON-RPC client for the editor's MCP bridge, the transient
//! fault retry policy, the cross-process state lock and the editor tool
//! wrappers.

pub mod editor;
pub mod error;
pub mod lock;
pub mod retry;
pub mod rpc;
pub mod status;
pub mod types;

// Re-export commonly used types
pub use editor::{wait_for_idle, EditorControl, EditorStatus, EditorTools};
pub use error::{Error, Result};
pub use lock::{ExclusiveStateLock, StateLockGuard};
pub use retry::{RetryPolicy, TransientFault};
pub use rpc::{RpcClient, RpcClientConfig};
pub use status::{CompileStatus, StatusClient, TestRunStatus};
pub use types::*;

/// edharness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default directory for lock files shared by all workers on this machine
pub fn default_locks_dir() -> std::path::PathBuf {
    std::env::temp_dir().join("edharness_locks")
}
