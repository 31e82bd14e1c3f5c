//! Baton CLI library: command implementations shared by the `baton`
//! binary and the integration tests.

pub mod commands;
