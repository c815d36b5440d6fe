//! A library and command-line tool for batch-flashing UF2 firmware images
//! through a UF2 Batch Flasher gateway
//!
//! The gateway exposes a rack of up to 64 USB-attached targets behind a
//! single TCP connection. This crate implements the client side of its
//! protocol: correlation of pushed gateway messages ([mailbox]), the wire
//! codec and transport ([connection]), the per-device status model
//! ([status]), sentinel patching of UF2 images ([uf2]) and the
//! flow-controlled flashing pipeline ([flasher]).

pub mod cli;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod logging;
pub mod mailbox;
pub mod status;
pub mod uf2;

pub use crate::{
    connection::Connection,
    error::{ConnectionError, Error},
    flasher::Flasher,
    uf2::Uf2Image,
};
