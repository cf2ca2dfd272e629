//! rpb-daemon — HTTP service around the button actuation core.
//!
//! Wires `rpb-core` to the outside world: a JSON API behind HTTP basic
//! auth, `SQLite` persistence for press/state/access history, and an
//! embedded single-page UI. The binary in `main.rs` adds configuration,
//! logging, and signal-driven shutdown on top.
//!
//! # Modules
//!
//! - [`auth`]: basic-auth middleware, access-attempt logging, CORS
//! - [`db`]: the `SQLite` persistence gateway and history pagination
//! - [`http`]: the router, handlers, and error envelope

pub mod auth;
pub mod db;
pub mod http;
