#[macro_use]
extern crate tracing;

pub mod cli;
pub mod daemon;
pub mod device;
pub mod dispatcher;
pub mod ipc;
pub mod keyboard;
pub mod sink;
pub mod utils;
pub mod watcher;
