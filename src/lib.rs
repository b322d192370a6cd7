//! Session-bound container sandboxes that build and run submitted source files.
//!
//! A browser session is bound to at most one running sandbox. Opening a
//! language page provisions it; submissions copy files in, run a command and
//! return the cleaned combined output.

pub mod archive;
pub mod config;
pub mod docker;
pub mod error;
pub mod http_server;
pub mod keystore;
pub mod lifecycle;
pub mod output;
pub mod pipeline;
pub mod runtime;
pub mod session;
pub mod state;
pub mod templates;

pub use error::{Error, Result};
