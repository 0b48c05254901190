//! USB function (device side) stack built on the [usb-device] wire types
//!
//! A [Stack] enumerates one or more device controllers, answers the standard
//! requests and hands the interfaces of the active configuration to
//! registered [class drivers]. Controllers plug in through
//! [FunctionController].
//!
//! # Class drivers:
//! * [Mass Storage] - Bulk Only Transport, command sets left to the client
//! * [RNDIS] - Remote NDIS control and data channels
//! * Custom - implement the [ClassDriver] trait
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `msc` | Include the Mass Storage Bulk Only driver |
//! | `rndis` | Include the RNDIS driver |
//! | `superspeed` | USB 3.0 requests, function suspend and link power management |
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [usb-device]: https://crates.io/crates/usb-device
//! [class drivers]: crate::driver
//! [Mass Storage]: crate::msc
//! [RNDIS]: crate::rndis
//! [Stack]: crate::stack::Stack
//! [FunctionController]: crate::hal::FunctionController
//! [ClassDriver]: crate::driver::ClassDriver

#![no_std]

pub(crate) mod fmt;

pub mod descriptor;
pub mod device;
pub mod driver;
pub mod error;
pub mod hal;
pub mod irp;
pub mod stack;

#[cfg(feature = "msc")]
pub mod msc;
#[cfg(feature = "rndis")]
pub mod rndis;

pub use error::{Error, Result};
