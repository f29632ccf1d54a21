//! # bftp-server
//!
//! The bftp protocol engine: a per-connection [`session::Session`] state
//! machine, the shared [`registry::Registry`] (send capabilities, logins,
//! namespace gate), and the TCP accept loop in [`server`].

pub mod registry;
pub mod server;
pub mod session;
