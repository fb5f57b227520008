//! 核心公共层：错误类型与后台循环 / 关闭原语

pub mod error;
pub mod shutdown;

pub use error::{CoordinatorError, PhaseFailure, ResourceError};
pub use shutdown::{CleanupCallback, FnCleanup, LoopHandle, ShutdownSignal};
