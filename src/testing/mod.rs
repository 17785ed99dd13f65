//! Testing utilities for the data grid.
//!
//! Provides in-memory implementations of the transport collaborators so a
//! whole multi-node, multi-site deployment can run inside one process:
//!
//! - [`LoopbackNetwork`] — wires coordinators, topology handlers and
//!   replication managers of several in-process "nodes" together and can
//!   cut individual nodes off to simulate failures
//! - [`StubSite`] — a programmable backup site recording what it receives
//!
//! The end-to-end scenarios in this module drive real component instances
//! through the public API only; nothing here reaches into private state.

mod loopback;


pub use loopback::{LoopbackNetwork, LoopbackTransport, StubSite};
