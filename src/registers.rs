//! Register map and sized register access
//!
//! Registers are identified by [`Register`] and live at a `(bank, offset)`
//! pair in the hub firmware. Each has a fixed width. A read sends
//! `[bank, offset]` and reads back exactly that many bytes; a write sends
//! `[bank, offset, data..]`. Any other byte count is a protocol error.

use heapless::Vec;

use crate::hal::i2c::{HubBus, Transport};
use crate::sensorhub::{Error, Platform, SensorHub};

/// Widest register in the map
pub const MAX_REG_SIZE: usize = 8;

/// Bytes of one register
pub type RegValue = Vec<u8, MAX_REG_SIZE>;

/// Bank (message type) identifiers understood by the hub firmware
pub mod bank {
    /// Interrupts, clock and firmware version
    pub const GENERAL: u8 = 0x00;
    /// Accelerometer
    pub const ACCEL: u8 = 0x01;
    /// Gyroscope
    pub const GYRO: u8 = 0x02;
    /// Compass
    pub const COMPASS: u8 = 0x03;
    /// Barometer
    pub const PRESSURE: u8 = 0x04;
    /// Pedometer
    pub const PEDOMETER: u8 = 0x05;
    /// Metabolic equivalents
    pub const METS: u8 = 0x06;
    /// Ambient light sensor
    pub const LIGHTSENSOR: u8 = 0x07;
    /// Host-side settings
    pub const USERSETTINGS: u8 = 0x08;
    /// Firmware logging
    pub const LOG: u8 = 0x09;
    /// Factory test commands
    pub const TCMD: u8 = 0x0A;
    /// Number of valid banks; the normal firmware NACKs anything at or above it
    pub const NUM: u8 = 0x0B;
}

/// Location and width of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegInfo {
    /// Bank identifier, see [`bank`]
    pub bank: u8,
    /// Byte offset within the bank
    pub offset: u8,
    /// Width in bytes
    pub size: usize,
}

macro_rules! register_map {
    ($( $(#[$doc:meta])* $name:ident = ($bank:expr, $offset:expr, $size:expr), )+) => {
        /// Hub registers. The discriminant is the stable numeric register id.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        #[repr(u16)]
        pub enum Register {
            $(
                $(#[$doc])*
                #[doc = concat!("Bank `", stringify!($bank), "`, offset `", stringify!($offset), "`, ", stringify!($size), " byte(s)")]
                $name,
            )+
        }

        impl Register {
            /// Every register, indexed by id
            pub const ALL: &'static [Register] = &[ $( Register::$name, )+ ];

            /// Location and width of this register
            pub const fn info(self) -> RegInfo {
                match self {
                    $( Register::$name => RegInfo { bank: $bank, offset: $offset, size: $size }, )+
                }
            }
        }
    };
}

register_map! {
    GeneralInterrupt0Status = (bank::GENERAL, 0x00, 1),
    GeneralInterrupt1Status = (bank::GENERAL, 0x01, 1),
    GeneralInterrupt0Enable = (bank::GENERAL, 0x02, 1),
    GeneralInterrupt1Enable = (bank::GENERAL, 0x03, 1),
    /// Seconds since the epoch, kept by the hub RTC
    GeneralUtc = (bank::GENERAL, 0x04, 4),
    GeneralApAlarm = (bank::GENERAL, 0x08, 4),
    GeneralFirmwareVersion = (bank::GENERAL, 0x0C, 2),
    AccelSampleRate = (bank::ACCEL, 0x00, 2),
    AccelX = (bank::ACCEL, 0x02, 4),
    AccelY = (bank::ACCEL, 0x06, 4),
    AccelZ = (bank::ACCEL, 0x0A, 4),
    AccelX2 = (bank::ACCEL, 0x0E, 4),
    AccelY2 = (bank::ACCEL, 0x12, 4),
    AccelZ2 = (bank::ACCEL, 0x16, 4),
    GyroSampleRate = (bank::GYRO, 0x00, 2),
    GyroX = (bank::GYRO, 0x02, 4),
    GyroY = (bank::GYRO, 0x06, 4),
    GyroZ = (bank::GYRO, 0x0A, 4),
    GyroX2 = (bank::GYRO, 0x0E, 4),
    GyroY2 = (bank::GYRO, 0x12, 4),
    GyroZ2 = (bank::GYRO, 0x16, 4),
    CompassSampleRate = (bank::COMPASS, 0x00, 2),
    CompassX = (bank::COMPASS, 0x02, 4),
    CompassY = (bank::COMPASS, 0x06, 4),
    CompassZ = (bank::COMPASS, 0x0A, 4),
    CompassAccuracy = (bank::COMPASS, 0x0E, 1),
    PressureSampleRate = (bank::PRESSURE, 0x00, 2),
    PressureAltitude = (bank::PRESSURE, 0x02, 4),
    PedometerActivity = (bank::PEDOMETER, 0x00, 1),
    PedometerTotalDistance = (bank::PEDOMETER, 0x01, 4),
    PedometerTotalSteps = (bank::PEDOMETER, 0x05, 4),
    PedometerCurrentSpeed = (bank::PEDOMETER, 0x09, 2),
    PedometerFloorsClimbed = (bank::PEDOMETER, 0x0B, 2),
    MetsCalories = (bank::METS, 0x00, 4),
    LightSensorSampleRate = (bank::LIGHTSENSOR, 0x00, 2),
    LightSensorSignal = (bank::LIGHTSENSOR, 0x02, 2),
    UserSettingsScreenStatus = (bank::USERSETTINGS, 0x00, 1),
    /// Packed 2-bit log level per firmware log tag
    LogLogEnable = (bank::LOG, 0x00, 8),
}

impl Register {
    /// Stable numeric id
    pub const fn id(self) -> u16 {
        self as u16
    }

    /// Width in bytes
    pub const fn size(self) -> usize {
        self.info().size
    }
}

impl TryFrom<u16> for Register {
    type Error = Error;

    fn try_from(id: u16) -> Result<Self, Error> {
        Register::ALL.get(usize::from(id)).copied().ok_or(Error::InvalidArgument)
    }
}

/// Which bits of a register a write may change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mask<'a> {
    /// No mask: every bit is written
    All,
    /// Per-byte mask; only set bits change
    Bits(&'a [u8]),
}

impl<T: Transport> HubBus<T> {
    /// Read a whole register.
    ///
    /// Fails with [`Error::BadExchange`] unless exactly `reg.size()` bytes come
    /// back.
    pub fn read_register(&mut self, reg: Register) -> Result<RegValue, Error> {
        let info = reg.info();
        let mut value = RegValue::new();
        value.resize_default(info.size).map_err(|_| Error::OutOfMemory)?;

        let count = self.write_read(&[info.bank, info.offset], &mut value)?;
        if count != info.size {
            error!("Read {} bytes instead of {} from {:?}", count, info.size, reg);
            return Err(Error::BadExchange);
        }
        Ok(value)
    }

    /// Write a whole register, changing only the bits selected by `mask`.
    ///
    /// Partial masks are applied as read-modify-write on this bus; callers
    /// already hold the register access lock so nothing interleaves. Returns
    /// the register size on success.
    pub fn write_register(&mut self, reg: Register, value: &[u8], mask: Mask<'_>) -> Result<usize, Error> {
        let info = reg.info();
        if value.len() != info.size {
            return Err(Error::InvalidArgument);
        }

        let mut payload = [0u8; MAX_REG_SIZE];
        payload[..info.size].copy_from_slice(value);

        if let Mask::Bits(bits) = mask {
            if bits.len() != info.size {
                return Err(Error::InvalidArgument);
            }
            if bits.iter().any(|&b| b != 0xFF) {
                let current = self.read_register(reg)?;
                for (i, byte) in payload[..info.size].iter_mut().enumerate() {
                    *byte = (current[i] & !bits[i]) | (value[i] & bits[i]);
                }
            }
        }

        let mut frame: Vec<u8, { MAX_REG_SIZE + 2 }> = Vec::new();
        frame
            .extend_from_slice(&[info.bank, info.offset])
            .and_then(|()| frame.extend_from_slice(&payload[..info.size]))
            .map_err(|()| Error::OutOfMemory)?;

        let written = self.write(&frame)?;
        if written != frame.len() {
            error!("Wrote {} bytes instead of {} to {:?}", written, frame.len(), reg);
            return Err(Error::BadExchange);
        }
        Ok(info.size)
    }

    /// Write a single-byte register under `mask`
    pub fn write_register_byte(&mut self, reg: Register, value: u8, mask: u8) -> Result<usize, Error> {
        if reg.size() != 1 {
            return Err(Error::InvalidArgument);
        }
        self.write_register(reg, &[value], Mask::Bits(&[mask]))
    }
}

/// Little-endian value of a register's bytes
pub(crate) fn le_value(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

impl<P: Platform> SensorHub<P> {
    /// Width of `reg` in bytes
    pub fn reg_size(&self, reg: Register) -> usize {
        reg.size()
    }

    /// Read `reg` under the register access lock
    pub fn reg_read(&self, reg: Register) -> Result<RegValue, Error> {
        self.bus.lock().read_register(reg)
    }

    /// Write `reg` under the register access lock. Returns bytes written.
    pub fn reg_write(&self, reg: Register, value: &[u8], mask: Mask<'_>) -> Result<usize, Error> {
        self.bus.lock().write_register(reg, value, mask)
    }

    /// Write a one-byte register under the register access lock
    pub fn reg_write_1byte(&self, reg: Register, value: u8, mask: u8) -> Result<usize, Error> {
        self.bus.lock().write_register_byte(reg, value, mask)
    }

    /// Take the register access lock.
    ///
    /// Everything done through the guard is one atomic transaction with
    /// respect to other register traffic. The lock is not reentrant: do not call
    /// other `reg_*` methods while holding it.
    pub fn lock_registers(&self) -> spin::MutexGuard<'_, HubBus<P::Transport>> {
        self.bus.lock()
    }

    /// Raw write-then-read against the hub, under the register access lock
    pub fn i2c_write_read(&self, request: &[u8], response: &mut [u8]) -> Result<usize, Error> {
        Ok(self.bus.lock().write_read(request, response)?)
    }
}
