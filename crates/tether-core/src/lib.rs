//! # tether-core
//!
//! Foundation types for the tether signaling relay.
//!
//! This crate provides the shared vocabulary the signaling core and the
//! server crate depend on:
//!
//! - **Branded IDs**: [`ids::DeviceId`], [`ids::SessionId`], [`ids::ConnectionId`] as newtypes
//! - **Wire envelope**: [`envelope::Envelope`] and the [`envelope::SignalMessage`] tagged union
//! - **Sessions**: [`session::SessionStatus`], [`session::SessionDto`], create/join requests
//! - **Errors**: [`errors::SignalError`] hierarchy via `thiserror`, with wire error codes
//! - **Constants**: [`constants`] — signaling port, ping interval, queue bounds
//! - **Logging**: [`logging::init_tracing`] subscriber setup
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `tether-signaling` and `tether-server`.

#![deny(unsafe_code)]

pub mod constants;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod session;
