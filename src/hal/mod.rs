//! Hardware abstraction for the M4 sensor hub
//!
//! This module provides the host-side hardware seams the core driver runs on:
//! the I2C transport, the GPIO group used for reset and boot-source selection,
//! and settle timing.

pub mod gpio;
pub mod i2c;
pub mod timer;
