//! Reusable data-pipe microservice bases.
//!
//! - `onepipe`: provider/consumer services over a single FBDP pipe.
//! - `filter`: services transforming an input pipe into an output
//!   pipe, with an internal wake channel.

pub mod filter;
pub mod onepipe;
