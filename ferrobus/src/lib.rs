//! # Ferrobus
//!
//! A distributed-service platform core built on ZeroMQ.
//!
//! ## Architecture
//!
//! Ferrobus is structured as a **messaging kernel** with clean
//! layering:
//!
//! - **`ferrobus-core`**: channels, sessions, protocol dispatch and
//!   the channel manager with its unified poll
//! - **`ferrobus-proto`**: the FBSP, FBDP and ICCP wire protocols
//! - **`ferrobus`**: the microservice runtime, controllers, bundle
//!   orchestration and data-pipe service bases (this crate)
//!
//! ## Model
//!
//! Each component runs a single-threaded cooperative I/O loop over a
//! [`ChannelManager`](ferrobus_core::manager::ChannelManager);
//! concurrency between components comes from hosting each one in its
//! own worker thread. Controllers talk to their components over the
//! inproc ICCP control channel: startup handshake (`READY`),
//! reconfiguration (`REQUEST`), graceful stop (`STOP`) and termination
//! reporting (`FINISHED`/`ERROR`). The bundle controller starts an
//! ordered collection of components and propagates their bound
//! endpoint addresses into the configuration of later ones.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod bundle;
pub mod config;
pub mod controller;
pub mod data;
pub mod dev_tracing;
pub mod micro;
pub mod registry;
pub mod scheduler;

pub use ferrobus_core;
pub use ferrobus_proto;

// A small prelude to make embedding ergonomic.
pub mod prelude {
    pub use crate::bundle::BundleController;
    pub use crate::config::{AddressBook, ConfigTable};
    pub use crate::controller::{DirectController, ThreadController};
    pub use crate::data::filter::{DataFilterService, FilterConfig, FilterHandler};
    pub use crate::data::onepipe::{DataPipeService, PipeConfig, PipeHandler};
    pub use crate::micro::{
        Component, ComponentContext, ComponentFactory, MicroService, Runtime, ServiceImpl,
        StopToken,
    };
    pub use crate::registry::{RegisteredService, ServiceRegistry};
    pub use crate::scheduler::SchedulerHandle;
    pub use ferrobus_core::prelude::*;
}
