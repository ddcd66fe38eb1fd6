//! # Bastio Agent
//!
//! A host-resident agent that keeps a mutually authenticated SSH channel to
//! the Bastio backend and provisions local system accounts and their SSH
//! authorized-keys material on the backend's behalf.
//!
//! ## Architecture
//!
//! - [`pool`]: adaptive worker pool hosting the long-running tasks.
//! - [`connector`]: outbound SSH client with a pinned backend host key,
//!   relaying framed [`bastio_proto`] messages between the `bastio-agent`
//!   subsystem channel and registered endpoints.
//! - [`processor`]: consumes action messages and replies with feedback.
//! - [`accounts`]: the actual user/group/authorized-keys mutations.
//! - [`enroll`]: one-shot HTTPS enrollment calls surrounding startup.
//! - [`config`], [`keys`], [`logging`], [`commands`]: CLI-facing glue.
//!
//! Data flows backend → SSH → netstring decoder → message parser → ingress
//! → processor → egress → netstring encoder → SSH → backend; one feedback
//! per action, correlated by `mid`.

pub mod accounts;
pub mod commands;
pub mod config;
pub mod connector;
pub mod enroll;
pub mod error;
pub mod keys;
pub mod logging;
pub mod pool;
pub mod processor;

pub use error::{AgentError, AgentResult};
