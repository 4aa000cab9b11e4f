//! Hub panic detection and recovery
//!
//! The hub firmware runs one of two I2C slave programs. The normal program
//! serves the valid banks and NACKs everything else with `0xFF`; once the hub
//! has panicked, a panic program takes over which answers every normal bank
//! with zeroes and answers the reserved panic bank with a magic word.
//!
//! So an interrupt with no pending source is suspicious, and asking the panic
//! bank settles it: only the exact 4-byte magic confirms a panic. Anything else
//! is logged and dropped, never escalated to a reset.

use crate::firmware::FirmwareLoader;
use crate::hal::i2c::{HubBus, Transport, TransportError};
use crate::registers::le_value;
use crate::sensorhub::{Error, Mode, Platform, SensorHub};

/// Reserved bank served only by the panic handler program
pub const PANIC_BANK: u8 = 0xFF;
/// Panic handoff command
pub const PANIC_CMD_CHECK: u8 = 0xCD;
/// Panic handoff magic, little-endian on the wire
pub const PANIC_RESP_CHECK: u32 = 0xDEAD_BEEF;
/// What the normal program answers for a bank it does not serve
pub const PANIC_NACK: u8 = 0xFF;

/// Settle time between the recovery reset and the firmware reload
const PANIC_SETTLE_MS: u32 = 100;

/// Restore hooks run after a hub restart.
///
/// The declaration order is the invocation order, except that
/// [`PanicSlot::IrqRestore`] always runs last: interrupt enables are only
/// restored once every other subsystem has re-armed its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PanicSlot {
    /// Display client
    DisplayRestore,
    /// Accelerometer client
    AccelRestore,
    /// Gyroscope client
    GyroRestore,
    /// MPU9150 client
    Mpu9150Restore,
    /// Interrupt enables, owned by the driver
    IrqRestore,
}

impl PanicSlot {
    /// Number of slots
    pub const COUNT: usize = 5;

    /// Every slot, in declaration order
    pub const ALL: [PanicSlot; PanicSlot::COUNT] = [
        PanicSlot::DisplayRestore,
        PanicSlot::AccelRestore,
        PanicSlot::GyroRestore,
        PanicSlot::Mpu9150Restore,
        PanicSlot::IrqRestore,
    ];

    /// Name used in log messages
    pub const fn name(self) -> &'static str {
        match self {
            PanicSlot::DisplayRestore => "display_restore",
            PanicSlot::AccelRestore => "accel_restore",
            PanicSlot::GyroRestore => "gyro_restore",
            PanicSlot::Mpu9150Restore => "mpu9150_restore",
            PanicSlot::IrqRestore => "irq_restore",
        }
    }

    /// Order in which restore hooks run: ascending, with `IrqRestore` moved
    /// to the end wherever it sits in the enumeration.
    pub fn invocation_order() -> [PanicSlot; PanicSlot::COUNT] {
        let mut order = Self::ALL;
        order.sort_unstable_by_key(|&slot| (slot == PanicSlot::IrqRestore, slot));
        order
    }
}

/// A restore hook. The handler object is its own context.
pub trait PanicHandler<P: Platform>: Sync {
    /// The hub was reset and its firmware reloaded; put state back.
    ///
    /// Called with the panic registry and the power-management lock held: do
    /// not register or unregister panic handlers, suspend or resume from here.
    fn restore(&self, hub: &SensorHub<P>);
}

/// Per-hub restore hook table
pub struct PanicRegistry<P: Platform> {
    slots: spin::Mutex<[Option<&'static dyn PanicHandler<P>>; PanicSlot::COUNT]>,
}

impl<P: Platform> PanicRegistry<P> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: spin::Mutex::new([None; PanicSlot::COUNT]),
        }
    }
}

/// Outcome of asking the panic bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PanicCheck {
    /// The panic program answered with the magic word
    Panicked,
    /// The normal program rejected the panic bank
    Running,
    /// Anything else: wrong length or wrong value
    Unknown { count: usize, data: u32 },
}

/// Ask the panic bank whether the hub has panicked.
///
/// The caller must hold the register access lock for the whole exchange.
pub fn check_panic<T: Transport>(bus: &mut HubBus<T>) -> Result<PanicCheck, TransportError> {
    let mut response = [0u8; 4];
    let count = bus.write_read(&[PANIC_BANK, PANIC_CMD_CHECK], &mut response)?;
    let data = le_value(&response[..count.min(response.len())]) as u32;

    Ok(if count == response.len() && data == PANIC_RESP_CHECK {
        PanicCheck::Panicked
    } else if count == 1 && response[0] == PANIC_NACK {
        PanicCheck::Running
    } else {
        PanicCheck::Unknown { count, data }
    })
}

impl<P: Platform> SensorHub<P> {
    /// Install `handler` in `slot`.
    ///
    /// An occupied slot is never overwritten: fails with
    /// [`Error::PermissionDenied`].
    pub fn panic_register(&self, slot: PanicSlot, handler: &'static dyn PanicHandler<P>) -> Result<(), Error> {
        let mut slots = self.panic.slots.lock();
        let entry = &mut slots[slot as usize];
        if entry.is_some() {
            error!("{} callback registration failed", slot.name());
            return Err(Error::PermissionDenied);
        }
        *entry = Some(handler);
        info!("{} callback registered", slot.name());
        Ok(())
    }

    /// Clear `slot`, whether or not it was populated.
    pub fn panic_unregister(&self, slot: PanicSlot) {
        self.panic.slots.lock()[slot as usize] = None;
        info!("{} callback un-registered", slot.name());
    }

    pub(crate) fn panic_shutdown(&self) {
        *self.panic.slots.lock() = [None; PanicSlot::COUNT];
    }

    /// Check for a hub panic and recover from it.
    ///
    /// On a confirmed panic the hub is reset and its firmware reloaded with the
    /// register access lock held throughout, then every restore hook runs in
    /// [`PanicSlot::invocation_order`]. The whole sequence excludes
    /// [`SensorHub::suspend`] and [`SensorHub::resume`].
    ///
    /// Does nothing until interrupt dispatch is up, since there is no
    /// firmware image to reload before that.
    ///
    /// # Panics
    ///
    /// If the firmware cannot be reloaded. A hub that panicked and cannot be
    /// restarted leaves no safe state to continue in.
    pub(crate) fn panic_process(&self) {
        if !self.irq_ready() {
            warn!("Panic check before M4 firmware is running");
            return;
        }

        let _pm = self.pm.lock();
        {
            let mut bus = self.bus.lock();
            match check_panic(&mut *bus) {
                Ok(PanicCheck::Panicked) => {}
                Ok(PanicCheck::Running) => {
                    error!("Unknown IRQ status! Hub rejected the panic bank");
                    return;
                }
                Ok(PanicCheck::Unknown { count, data }) => {
                    error!("Unknown IRQ status! M4 panic handoff ret={}, data={:#x}", count, data);
                    return;
                }
                Err(e) => {
                    error!("Unknown IRQ status! M4 panic handoff failed: {:?}", e);
                    return;
                }
            }

            error!("Detected M4 panic, reset M4!");
            self.set_mode(Mode::BootMode);
            if let Err(e) = self.hw_reset() {
                error!("Hub reset during panic recovery failed: {:?}", e);
            }
            self.hw.lock().timer.sleep_ms(PANIC_SETTLE_MS);

            match self.firmware.lock().load(&mut *bus, None, true) {
                Ok(version) => self.set_firmware_version(version),
                Err(e) => panic!("Failed to restart M4 sensor hub: {:?}", e),
            }
        }
        self.set_mode(Mode::NormalMode);

        let slots = self.panic.slots.lock();
        for slot in PanicSlot::invocation_order() {
            if let Some(handler) = slots[slot as usize] {
                info!("Calling {} as M4 restarted!", slot.name());
                handler.restore(self);
            }
        }
    }
}
