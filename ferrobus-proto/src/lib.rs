//! Ferrobus protocol implementations.
//!
//! Three wire protocols layered on ZeroMQ multipart messages:
//! - **FBSP** (`fbsp`): request/reply service protocol with sessions,
//!   cancellation, state reporting and ACK flows.
//! - **FBDP** (`fbdp`): flow-controlled data-pipe protocol with
//!   batch-based credit negotiation and typed close codes.
//! - **ICCP** (`iccp`): internal control protocol between a component
//!   and its controller.
//!
//! The `payload` module holds the dataframe structures these protocols
//! carry in their payload frames.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod fbdp;
pub mod fbsp;
pub mod iccp;
pub mod payload;
