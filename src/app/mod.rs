//! # 应用运行时组件

pub mod worker_pool;

pub use worker_pool::{BackgroundPool, FatalEvent, FatalHook, abort_on_fatal};
