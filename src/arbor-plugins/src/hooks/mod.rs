//! Hook system: extension-point types and the dispatch engine.

pub mod manager;
pub mod types;

pub use manager::{HookManager, HookStats};
pub use types::{
    HookCallback, HookContext, HookPriority, HookRegistration, HookType, callback_fn,
};
