//! Command implementations for the kegwright CLI.

pub mod bootstrap;
pub mod info;
pub mod install;
pub mod service;
pub mod test;
