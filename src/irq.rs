//! Interrupt dispatch
//!
//! The hub raises one physical interrupt line. Which logical sources are
//! pending is reported by the general interrupt status registers, one bit per
//! [`Irq`]; the matching enable registers gate which sources the hub may
//! raise at all.
//!
//! A logical IRQ moves `Unregistered -> Registered(disabled) ->
//! Registered(enabled)`. Only registered *and* enabled sources reach their
//! handler, whatever the hub reports as pending.

use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use bitflags::bitflags;
use heapless::Vec;

use crate::panic::{PanicHandler, PanicSlot};
use crate::registers::{Mask, Register};
use crate::sensorhub::{DebugLevel, Error, Platform, SensorHub};

/// Logical interrupts multiplexed onto the hub interrupt line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Irq {
    /// New accelerometer sample
    AccelDataReady,
    /// New gyroscope sample
    GyroDataReady,
    /// New compass sample
    CompassDataReady,
    /// New pressure sample
    PressureDataReady,
    /// Pedometer counters updated
    PedometerDataReady,
    /// Detected activity changed
    ActivityChange,
    /// New ambient light sample
    LightSensorDataReady,
    /// Host alarm set in the hub RTC expired
    ApAlarmExpired,
    /// Motion after a still period
    StillModeExit,
    /// New MPU9150 sample
    Mpu9150DataReady,
}

impl Irq {
    /// Number of logical interrupts
    pub const COUNT: usize = 10;

    /// Every logical interrupt, in bit order
    pub const ALL: [Irq; Irq::COUNT] = [
        Irq::AccelDataReady,
        Irq::GyroDataReady,
        Irq::CompassDataReady,
        Irq::PressureDataReady,
        Irq::PedometerDataReady,
        Irq::ActivityChange,
        Irq::LightSensorDataReady,
        Irq::ApAlarmExpired,
        Irq::StillModeExit,
        Irq::Mpu9150DataReady,
    ];

    const STATUS_REGISTERS: [Register; 2] = [
        Register::GeneralInterrupt0Status,
        Register::GeneralInterrupt1Status,
    ];

    const ENABLE_REGISTERS: [Register; 2] = [
        Register::GeneralInterrupt0Enable,
        Register::GeneralInterrupt1Enable,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn group(self) -> usize {
        self.index() / 8
    }

    /// Bit of this source within its status/enable register
    fn bit(self) -> u8 {
        1 << (self.index() % 8)
    }

    fn enable_register(self) -> Register {
        Self::ENABLE_REGISTERS[self.group()]
    }

    /// Set containing only this source
    pub const fn flag(self) -> IrqSet {
        IrqSet::from_bits_retain(1 << self as u16)
    }
}

bitflags! {
    /// A set of logical interrupts, bit `n` for `Irq::ALL[n]`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqSet: u16 {
        /// [`Irq::AccelDataReady`]
        const ACCEL_DATA_READY = 1 << 0;
        /// [`Irq::GyroDataReady`]
        const GYRO_DATA_READY = 1 << 1;
        /// [`Irq::CompassDataReady`]
        const COMPASS_DATA_READY = 1 << 2;
        /// [`Irq::PressureDataReady`]
        const PRESSURE_DATA_READY = 1 << 3;
        /// [`Irq::PedometerDataReady`]
        const PEDOMETER_DATA_READY = 1 << 4;
        /// [`Irq::ActivityChange`]
        const ACTIVITY_CHANGE = 1 << 5;
        /// [`Irq::LightSensorDataReady`]
        const LIGHTSENSOR_DATA_READY = 1 << 6;
        /// [`Irq::ApAlarmExpired`]
        const AP_ALARM_EXPIRED = 1 << 7;
        /// [`Irq::StillModeExit`]
        const STILLMODE_EXIT = 1 << 8;
        /// [`Irq::Mpu9150DataReady`]
        const MPU9150_DATA_READY = 1 << 9;
    }
}

impl IrqSet {
    /// Logical interrupts in this set, in bit order
    pub fn irqs(self) -> impl Iterator<Item = Irq> {
        Irq::ALL.into_iter().filter(move |irq| self.contains(irq.flag()))
    }

    fn from_group(group: usize, byte: u8) -> IrqSet {
        IrqSet::from_bits_truncate(u16::from(byte) << (group * 8))
    }

    fn group_byte(self, group: usize) -> u8 {
        // truncation keeps just this group's bits
        (self.bits() >> (group * 8)) as u8
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for IrqSet {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "IrqSet({=u16:#x})", self.bits());
    }
}

/// Handler for one logical interrupt.
///
/// Handlers run on the interrupt servicing path with no driver locks held, so
/// they may read and write registers directly. The handler object is its own
/// context.
pub trait IrqHandler<P: Platform>: Sync {
    /// `irq` was pending and enabled
    fn handle(&self, hub: &SensorHub<P>, irq: Irq);
}

struct IrqSlot<P: Platform> {
    handler: Option<&'static dyn IrqHandler<P>>,
    enabled: bool,
}

impl<P: Platform> Clone for IrqSlot<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Platform> Copy for IrqSlot<P> {}

impl<P: Platform> IrqSlot<P> {
    const EMPTY: Self = Self {
        handler: None,
        enabled: false,
    };
}

/// Per-hub interrupt dispatch state
pub struct IrqDispatcher<P: Platform> {
    slots: spin::RwLock<[IrqSlot<P>; Irq::COUNT]>,
    ready: AtomicBool,
    suspended: AtomicBool,
    wake_pending: AtomicU16,
}

impl<P: Platform> IrqDispatcher<P> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: spin::RwLock::new([IrqSlot::EMPTY; Irq::COUNT]),
            ready: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            wake_pending: AtomicU16::new(0),
        }
    }

    fn enabled_set(&self) -> IrqSet {
        let slots = self.slots.read();
        Irq::ALL
            .into_iter()
            .filter(|irq| slots[irq.index()].enabled)
            .fold(IrqSet::empty(), |set, irq| set | irq.flag())
    }
}

/// Restores the hub's interrupt enables after a panic restart.
pub(crate) struct IrqRestore;

pub(crate) static IRQ_RESTORE: IrqRestore = IrqRestore;

impl<P: Platform> PanicHandler<P> for IrqRestore {
    fn restore(&self, hub: &SensorHub<P>) {
        hub.irq_restore();
    }
}

impl<P: Platform> SensorHub<P> {
    /// Bring up interrupt dispatch: mask every source on the hub and hook
    /// enable-state restoration into panic recovery.
    pub(crate) fn irq_init(&self) -> Result<(), Error> {
        {
            let mut slots = self.irq.slots.write();
            let mut bus = self.bus.lock();
            for reg in Irq::ENABLE_REGISTERS {
                bus.write_register(reg, &[0x00], Mask::All)?;
            }
            for slot in slots.iter_mut() {
                slot.enabled = false;
            }
        }

        if let Err(e) = self.panic_register(PanicSlot::IrqRestore, &IRQ_RESTORE) {
            error!("IRQ enables will not survive a hub restart: {:?}", e);
            return Err(e);
        }
        self.irq.ready.store(true, Ordering::Release);
        debug!("M4 sensor hub IRQ dispatch ready");
        Ok(())
    }

    pub(crate) fn irq_ready(&self) -> bool {
        self.irq.ready.load(Ordering::Acquire)
    }

    /// Tear down interrupt dispatch: disable everything and drop every
    /// registration.
    pub(crate) fn irq_shutdown(&self) {
        if !self.irq.ready.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.irq_disable_all() {
            error!("Failed to disable hub IRQs at shutdown: {:?}", e);
        }
        *self.irq.slots.write() = [IrqSlot::EMPTY; Irq::COUNT];
        self.panic_unregister(PanicSlot::IrqRestore);
    }

    /// Register `handler` for `irq`. The source starts disabled.
    ///
    /// Fails with [`Error::PermissionDenied`] if `irq` already has a handler.
    pub fn irq_register(&self, irq: Irq, handler: &'static dyn IrqHandler<P>) -> Result<(), Error> {
        let mut slots = self.irq.slots.write();
        let slot = &mut slots[irq.index()];
        if slot.handler.is_some() {
            error!("{:?} is already registered", irq);
            return Err(Error::PermissionDenied);
        }
        *slot = IrqSlot {
            handler: Some(handler),
            enabled: false,
        };
        debug!("{:?} registered", irq);
        Ok(())
    }

    /// Drop the handler for `irq`, disabling the source first if needed.
    pub fn irq_unregister(&self, irq: Irq) -> Result<(), Error> {
        let mut slots = self.irq.slots.write();
        let slot = &mut slots[irq.index()];
        if slot.enabled {
            if let Err(e) = self.bus.lock().write_register_byte(irq.enable_register(), 0, irq.bit()) {
                warn!("Failed to disable {:?} while unregistering: {:?}", irq, e);
            }
        }
        *slot = IrqSlot::EMPTY;
        debug!("{:?} unregistered", irq);
        Ok(())
    }

    /// Enable `irq` on the hub. Enabling an enabled source is a no-op.
    pub fn irq_enable(&self, irq: Irq) -> Result<(), Error> {
        self.irq_set_enabled(irq, true)
    }

    /// Disable `irq` on the hub. Disabling a disabled source is a no-op.
    pub fn irq_disable(&self, irq: Irq) -> Result<(), Error> {
        self.irq_set_enabled(irq, false)
    }

    fn irq_set_enabled(&self, irq: Irq, enable: bool) -> Result<(), Error> {
        let mut slots = self.irq.slots.write();
        let slot = &mut slots[irq.index()];
        if slot.handler.is_none() {
            return Err(Error::InvalidArgument);
        }
        if slot.enabled == enable {
            return Ok(());
        }
        let value = if enable { irq.bit() } else { 0 };
        self.bus
            .lock()
            .write_register_byte(irq.enable_register(), value, irq.bit())?;
        slot.enabled = enable;
        Ok(())
    }

    /// Whether `irq` is currently enabled on the hub
    pub fn irq_enable_get(&self, irq: Irq) -> bool {
        self.irq.slots.read()[irq.index()].enabled
    }

    /// Disable every enabled source.
    ///
    /// Every source is attempted; the ones that could not be disabled are
    /// reported together in [`Error::PartialDisable`].
    pub fn irq_disable_all(&self) -> Result<(), Error> {
        let mut failed = IrqSet::empty();
        for irq in Irq::ALL {
            if !self.irq_enable_get(irq) {
                continue;
            }
            if let Err(e) = self.irq_disable(irq) {
                error!("Failed to disable {:?}: {:?}", irq, e);
                failed |= irq.flag();
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialDisable(failed))
        }
    }

    /// Service an assertion of the hub interrupt line.
    ///
    /// Reads the pending sources and calls the handler of each one that is
    /// registered and enabled. An interrupt with no pending source at all is
    /// how a panicked hub looks from here, so it triggers the panic check.
    pub fn handle_interrupt(&self) {
        if !self.irq_ready() {
            warn!("Hub interrupt before IRQ dispatch is ready");
            return;
        }

        let pending = match self.irq_pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!("Failed to read hub interrupt status: {:?}", e);
                return;
            }
        };

        if pending.is_empty() {
            self.panic_process();
            return;
        }

        if self.irq.suspended.load(Ordering::Acquire) {
            self.irq.wake_pending.fetch_or(pending.bits(), Ordering::AcqRel);
        }

        let mut ready: Vec<(Irq, &'static dyn IrqHandler<P>), { Irq::COUNT }> = Vec::new();
        {
            let slots = self.irq.slots.read();
            for irq in pending.irqs() {
                let slot = slots[irq.index()];
                match slot.handler {
                    Some(handler) if slot.enabled => {
                        // one entry per Irq, capacity is Irq::COUNT
                        let _ = ready.push((irq, handler));
                    }
                    _ => trace!("Ignoring pending {:?}", irq),
                }
            }
        }

        for (irq, handler) in ready {
            // an earlier handler, or another context, may have dropped it since
            if !self.irq_still_armed(irq, handler) {
                trace!("{:?} disarmed before dispatch", irq);
                continue;
            }
            handler.handle(self, irq);
        }
    }

    fn irq_still_armed(&self, irq: Irq, handler: &'static dyn IrqHandler<P>) -> bool {
        let slot = self.irq.slots.read()[irq.index()];
        slot.enabled && slot.handler.is_some_and(|current| core::ptr::addr_eq(current, handler))
    }

    fn irq_pending(&self) -> Result<IrqSet, Error> {
        let mut bus = self.bus.lock();
        let mut pending = IrqSet::empty();
        for (group, reg) in Irq::STATUS_REGISTERS.into_iter().enumerate() {
            let status = bus.read_register(reg)?;
            pending |= IrqSet::from_group(group, status[0]);
        }
        Ok(pending)
    }

    /// Rewrite the hub's enable registers from the registry.
    pub(crate) fn irq_restore(&self) {
        let enabled = self.irq.enabled_set();
        let mut bus = self.bus.lock();
        for (group, reg) in Irq::ENABLE_REGISTERS.into_iter().enumerate() {
            if let Err(e) = bus.write_register(reg, &[enabled.group_byte(group)], Mask::All) {
                error!("Failed to restore hub IRQ enables: {:?}", e);
            }
        }
        info!("Restored hub IRQ enables {:#x}", enabled.bits());
    }

    /// Start recording wake-up sources for suspend debugging
    pub(crate) fn irq_pm_dbg_suspend(&self) {
        self.irq.wake_pending.store(0, Ordering::Release);
        self.irq.suspended.store(true, Ordering::Release);
        if self.debug_level() >= DebugLevel::Info {
            info!("Suspending with hub IRQs {:#x} enabled", self.irq.enabled_set().bits());
        }
    }

    /// Report which sources fired while suspended
    pub(crate) fn irq_pm_dbg_resume(&self) -> IrqSet {
        self.irq.suspended.store(false, Ordering::Release);
        let woke = IrqSet::from_bits_truncate(self.irq.wake_pending.swap(0, Ordering::AcqRel));
        if self.debug_level() >= DebugLevel::Info {
            for irq in woke.irqs() {
                info!("Hub IRQ {:?} fired during suspend", irq);
            }
        }
        woke
    }
}
