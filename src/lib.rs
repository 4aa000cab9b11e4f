//! # M4 Sensor Hub Driver
//!
//! Core driver for the M4 sensor hub, a companion microcontroller on I2C that
//! aggregates motion and environmental sensors for the host.
//!
//! This driver provides the core every sensor client builds on:
//! - Sized register access serialized behind one register access lock
//! - Boot-mode selection and reset sequencing over the hub GPIOs
//! - Demultiplexing of the hub interrupt line into logical IRQs
//! - Hub panic detection, reset, firmware reload and state restore
//! - Deferred client initialization once the firmware is running
//!
//! ## Features
//!
//! - `defmt`: Route driver logging through defmt
//! - `log`: Route driver logging through the `log` facade
//! - `std`: Build against std
//!
//! ## Example
//!
//! ```rust,ignore
//! use m4sensorhub_driver::{Config, GpioMap, I2cTransport, Irq, SensorHub};
//!
//! let gpios = GpioMap { irq: Some(39), reset: Some(40), wake: Some(41),
//!     boot0: Some(42), boot1: Some(43), enable: Some(44) };
//! let config = Config::new("m4sensorhub.bin", gpios)?;
//! let hub: SensorHub<Board> = SensorHub::probe(config, I2cTransport::new(i2c), gpio, delay, loader)?;
//!
//! // once the firmware image has been fetched
//! hub.firmware_ready(Some(image))?;
//!
//! hub.irq_register(Irq::AccelDataReady, &ACCEL)?;
//! hub.irq_enable(Irq::AccelDataReady)?;
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::cargo
)]

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod firmware;
pub mod hal;
pub mod initcall;
pub mod irq;
pub mod loglevel;
pub mod panic;
pub mod registers;

mod sensorhub;

#[cfg(test)]
mod mock;

// Re-export the main driver and types
pub use sensorhub::{
    Config, DebugLevel, Error, HubStatus, HubVariant, Mode, Platform, SensorHub,
    TcmdResponse, MAX_FIRMWARE_NAME, TCMD_MAX_RESPONSE,
};

pub use firmware::{FirmwareError, FirmwareLoader, RequestState};
pub use initcall::InitCall;
pub use irq::{Irq, IrqHandler, IrqSet};
pub use panic::{PanicCheck, PanicHandler, PanicSlot};
pub use registers::{Mask, RegValue, Register};

// Re-export HAL components for board integration
pub use hal::{
    gpio::{BootMode, GpioController, GpioError, GpioMap, HwConfig, Level},
    i2c::{HubBus, I2cTransport, Transport, TransportError},
    timer::SettleTimer,
};
