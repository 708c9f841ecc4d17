// Library interface for pingrig-launcher
//
// This module exposes the core functionality for integration testing
// and potential future library use.

pub mod client;
pub mod config;
pub mod event_log;
pub mod server;
pub mod shutdown;
pub mod supervisor;
