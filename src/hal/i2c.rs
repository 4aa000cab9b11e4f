//! I2C transport to the M4 sensor hub
//!
//! The hub speaks a bank/offset protocol over plain I2C writes and
//! write-then-read transactions. Every transfer reports how many bytes actually
//! moved so that the register layer can reject short exchanges instead of
//! treating them as data.

use embedded_hal::i2c::{Error as _, ErrorKind, NoAcknowledgeSource};

/// Default 7-bit address of the sensor hub.
pub const M4SENSORHUB_I2C_ADDR: u8 = 0x18;

/// Address used by the STM32F401 based hub, which needs its own reset sequence.
pub const M4SENSORHUB_F401_I2C_ADDR: u8 = 0x39;

/// Transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Bus error (misplaced START/STOP)
    Bus,
    /// Arbitration lost to another master
    ArbitrationLoss,
    /// The hub did not acknowledge its address
    AddressNack,
    /// The hub did not acknowledge a data byte
    DataNack,
    /// Overrun/underrun
    Overrun,
    /// Any other controller failure
    Other,
}

impl From<ErrorKind> for TransportError {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Bus => TransportError::Bus,
            ErrorKind::ArbitrationLoss => TransportError::ArbitrationLoss,
            ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address) => TransportError::AddressNack,
            ErrorKind::NoAcknowledge(_) => TransportError::DataNack,
            ErrorKind::Overrun => TransportError::Overrun,
            _ => TransportError::Other,
        }
    }
}

/// Raw byte transport to the hub.
///
/// Both operations return the number of bytes transferred. A count smaller
/// than requested is not an error at this level.
pub trait Transport {
    /// Write `bytes` to the device at `address`.
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Write `request`, then read up to `response.len()` bytes back.
    fn write_read(
        &mut self,
        address: u8,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, TransportError>;
}

/// [`Transport`] over any `embedded-hal` I2C bus.
///
/// `embedded-hal` transfers are all-or-nothing, so a successful transfer always
/// reports the full length.
pub struct I2cTransport<I> {
    i2c: I,
}

impl<I> I2cTransport<I> {
    /// Wrap an I2C bus
    pub const fn new(i2c: I) -> Self {
        Self { i2c }
    }

    /// Give the bus back
    pub fn release(self) -> I {
        self.i2c
    }
}

impl<I: embedded_hal::i2c::I2c> Transport for I2cTransport<I> {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<usize, TransportError> {
        self.i2c
            .write(address, bytes)
            .map_err(|e| TransportError::from(e.kind()))?;
        Ok(bytes.len())
    }

    fn write_read(
        &mut self,
        address: u8,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, TransportError> {
        self.i2c
            .write_read(address, request, response)
            .map_err(|e| TransportError::from(e.kind()))?;
        Ok(response.len())
    }
}

/// The hub's end of the transport: a transport bound to the hub's address.
///
/// [`crate::SensorHub`] keeps this behind the global register-access lock;
/// holding a `&mut HubBus` means no other register traffic can interleave.
pub struct HubBus<T> {
    transport: T,
    address: u8,
}

impl<T: Transport> HubBus<T> {
    /// Bind `transport` to the hub at `address`
    pub const fn new(transport: T, address: u8) -> Self {
        Self { transport, address }
    }

    /// 7-bit address of the hub
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Raw write; returns the number of bytes the transport accepted.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.transport.write(self.address, bytes)
    }

    /// Raw write-then-read; returns the number of bytes read back.
    pub fn write_read(&mut self, request: &[u8], response: &mut [u8]) -> Result<usize, TransportError> {
        let count = self.transport.write_read(self.address, request, response)?;
        trace!("i2c write_read: {} byte request, {} of {} read", request.len(), count, response.len());
        Ok(count)
    }

    /// Direct access to the transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorType, Operation};

    #[derive(Debug)]
    struct FakeError(ErrorKind);

    impl embedded_hal::i2c::Error for FakeError {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    struct FakeI2c {
        fail: Option<ErrorKind>,
        last_address: u8,
        fill: u8,
    }

    impl ErrorType for FakeI2c {
        type Error = FakeError;
    }

    impl embedded_hal::i2c::I2c for FakeI2c {
        fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), FakeError> {
            if let Some(kind) = self.fail {
                return Err(FakeError(kind));
            }
            self.last_address = address;
            for op in operations {
                if let Operation::Read(buf) = op {
                    buf.fill(self.fill);
                }
            }
            Ok(())
        }
    }

    #[test]
    fn embedded_hal_transfers_report_full_length() {
        let i2c = FakeI2c { fail: None, last_address: 0, fill: 0xA5 };
        let mut bus = HubBus::new(I2cTransport::new(i2c), M4SENSORHUB_I2C_ADDR);

        let mut response = [0u8; 4];
        assert_eq!(bus.write_read(&[0x01, 0x02], &mut response), Ok(4));
        assert_eq!(response, [0xA5; 4]);
        assert_eq!(bus.write(&[0x01, 0x02, 0x03]), Ok(3));
        assert_eq!(bus.transport_mut().i2c.last_address, M4SENSORHUB_I2C_ADDR);
    }

    #[test]
    fn nack_on_address_is_distinguished() {
        let i2c = FakeI2c {
            fail: Some(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)),
            last_address: 0,
            fill: 0,
        };
        let mut bus = HubBus::new(I2cTransport::new(i2c), M4SENSORHUB_F401_I2C_ADDR);
        assert_eq!(bus.write(&[0x00]), Err(TransportError::AddressNack));
    }
}
