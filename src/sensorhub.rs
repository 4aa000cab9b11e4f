//! M4 sensor hub device context
//!
//! [`SensorHub`] owns everything attached to one physical hub: the I2C bus
//! behind the register access lock, the GPIO group and settle timer, the
//! firmware loader, and the interrupt, panic and init-call registries.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};

use bitflags::bitflags;
use embedded_hal::delay::DelayNs;
use heapless::{String, Vec};

use crate::firmware::{FirmwareError, FirmwareLoader, FirmwareRequest};
use crate::hal::gpio::{AcquireError, BootMode, GpioController, GpioError, GpioMap, HubGpios, HubPin, HwConfig, Level};
use crate::hal::i2c::{HubBus, Transport, TransportError, M4SENSORHUB_F401_I2C_ADDR, M4SENSORHUB_I2C_ADDR};
use crate::hal::timer::SettleTimer;
use crate::initcall::InitCallRegistry;
use crate::irq::{IrqDispatcher, IrqSet};
use crate::loglevel::apply_log_levels;
use crate::panic::PanicRegistry;
use crate::registers::{bank, le_value, Mask, Register};

/// Longest firmware file name accepted in [`Config`]
pub const MAX_FIRMWARE_NAME: usize = 64;

/// Largest response the test-command channel returns
pub const TCMD_MAX_RESPONSE: usize = 20;

/// Test-command response bytes
pub type TcmdResponse = Vec<u8, TCMD_MAX_RESPONSE>;

/// Sensor hub driver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Bad argument, unknown register, or the hub is not attached
    InvalidArgument,
    /// A GPIO or other board resource is missing
    NoDevice,
    /// The hub moved a different number of bytes than the exchange requires
    BadExchange,
    /// The slot is already taken
    PermissionDenied,
    /// A fixed-capacity registry is full
    OutOfMemory,
    /// I2C transfer failed
    Transport(TransportError),
    /// GPIO controller failed
    Gpio(GpioError),
    /// Firmware download failed
    Firmware(FirmwareError),
    /// The firmware request is not outstanding
    NotReady,
    /// `irq_disable_all` could not disable these sources
    PartialDisable(IrqSet),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<GpioError> for Error {
    fn from(e: GpioError) -> Self {
        Error::Gpio(e)
    }
}

impl From<FirmwareError> for Error {
    fn from(e: FirmwareError) -> Self {
        Error::Firmware(e)
    }
}

impl From<AcquireError> for Error {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::Missing(_) => Error::NoDevice,
            AcquireError::Controller(_, e) => Error::Gpio(e),
        }
    }
}

/// Operating mode of the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Mode {
    /// Attached, no firmware yet
    Uninitialized,
    /// Bootloader running; firmware download or panic recovery in progress
    BootMode,
    /// Firmware running and every client initialized
    NormalMode,
    /// Factory test firmware running
    FactoryMode,
}

impl Mode {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Mode::BootMode,
            2 => Mode::NormalMode,
            3 => Mode::FactoryMode,
            _ => Mode::Uninitialized,
        }
    }
}

/// Driver diagnostic verbosity, 0 (none) to 7 (verbose)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DebugLevel {
    /// 0
    NoDebug,
    /// 1
    Critical,
    /// 2
    Error,
    /// 3
    Warning,
    /// 4
    Notice,
    #[default]
    /// 5, the default
    Info,
    /// 6
    Debug,
    /// 7, adds register and test-command dumps
    VerboseDebug,
}

impl TryFrom<u8> for DebugLevel {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self, Error> {
        Ok(match level {
            0 => DebugLevel::NoDebug,
            1 => DebugLevel::Critical,
            2 => DebugLevel::Error,
            3 => DebugLevel::Warning,
            4 => DebugLevel::Notice,
            5 => DebugLevel::Info,
            6 => DebugLevel::Debug,
            7 => DebugLevel::VerboseDebug,
            _ => return Err(Error::InvalidArgument),
        })
    }
}

bitflags! {
    /// Sensor hub status flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HubStatus: u8 {
        /// GPIOs owned and transport bound
        const ATTACHED = 1 << 0;
        /// Firmware downloaded at least once
        const FIRMWARE_LOADED = 1 << 1;
        /// Between `suspend` and `resume`
        const SUSPENDED = 1 << 2;
    }
}

/// Hub board variant, told apart by I2C address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HubVariant {
    /// Hub at the default address
    Standard,
    /// STM32F401 based hub: boots from boot mode 01 with longer settle times
    F401,
}

impl HubVariant {
    /// Variant served at `address`
    pub const fn from_address(address: u8) -> Self {
        if address == M4SENSORHUB_F401_I2C_ADDR {
            HubVariant::F401
        } else {
            HubVariant::Standard
        }
    }
}

/// Attach-time configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// 7-bit I2C address of the hub
    pub address: u8,
    /// Firmware image to request; required
    pub firmware_name: Option<String<MAX_FIRMWARE_NAME>>,
    /// Board GPIO numbers
    pub gpios: GpioMap,
    /// Initial driver verbosity
    pub debug_level: DebugLevel,
    /// Flash even when the hub already runs the same version
    pub force_upgrade: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: M4SENSORHUB_I2C_ADDR,
            firmware_name: None,
            gpios: GpioMap::default(),
            debug_level: DebugLevel::default(),
            force_upgrade: false,
        }
    }
}

impl Config {
    /// Configuration for firmware `name` on the given GPIOs
    pub fn new(name: &str, gpios: GpioMap) -> Result<Self, Error> {
        let firmware_name = String::try_from(name).map_err(|()| Error::InvalidArgument)?;
        Ok(Self {
            firmware_name: Some(firmware_name),
            gpios,
            ..Self::default()
        })
    }

    /// Use `address` instead of the default hub address
    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }
}

/// Board hooks the driver runs on
pub trait Platform: 'static {
    /// I2C transport to the hub
    type Transport: Transport + Send;
    /// Board GPIO controller
    type Gpio: GpioController + Send;
    /// Blocking delay source
    type Delay: DelayNs + Send;
    /// Firmware image loader
    type Firmware: FirmwareLoader + Send;
}

/// GPIO group and timer, locked together for reset sequencing
pub(crate) struct HwControl<G, D> {
    pub(crate) gpios: HubGpios<G>,
    pub(crate) timer: SettleTimer<D>,
}

/// One attached M4 sensor hub.
///
/// Locks are always taken in the order power management, interrupt
/// registry, register access, hardware control.
pub struct SensorHub<P: Platform> {
    /// Serializes suspend/resume against panic recovery
    pub(crate) pm: spin::Mutex<()>,
    pub(crate) bus: spin::Mutex<HubBus<P::Transport>>,
    pub(crate) hw: spin::Mutex<HwControl<P::Gpio, P::Delay>>,
    pub(crate) firmware: spin::Mutex<P::Firmware>,
    pub(crate) irq: IrqDispatcher<P>,
    pub(crate) panic: PanicRegistry<P>,
    pub(crate) init_calls: InitCallRegistry<P>,
    fw_request: FirmwareRequest,
    variant: HubVariant,
    firmware_name: String<MAX_FIRMWARE_NAME>,
    mode: AtomicU8,
    status: AtomicU8,
    fw_version: AtomicU16,
    debug: AtomicU8,
    force_upgrade: AtomicBool,
    tcmd_passed: AtomicBool,
}

impl<P: Platform> SensorHub<P> {
    /// Attach to a hub.
    ///
    /// Claims the GPIO group, resets the hub and arms the firmware request;
    /// the image is handed over later through [`SensorHub::firmware_ready`].
    pub fn probe(
        config: Config,
        transport: P::Transport,
        gpio: P::Gpio,
        delay: P::Delay,
        firmware: P::Firmware,
    ) -> Result<Self, Error> {
        let Some(firmware_name) = config.firmware_name else {
            error!("Missing M4 sensorhub firmware filename");
            return Err(Error::InvalidArgument);
        };
        info!("Initializing M4 Sensor Hub debug={}", config.debug_level as u8);

        let hub = Self {
            pm: spin::Mutex::new(()),
            bus: spin::Mutex::new(HubBus::new(transport, config.address)),
            hw: spin::Mutex::new(HwControl {
                gpios: HubGpios::new(gpio),
                timer: SettleTimer::new(delay),
            }),
            firmware: spin::Mutex::new(firmware),
            irq: IrqDispatcher::new(),
            panic: PanicRegistry::new(),
            init_calls: InitCallRegistry::new(),
            fw_request: FirmwareRequest::new(),
            variant: HubVariant::from_address(config.address),
            firmware_name,
            mode: AtomicU8::new(Mode::Uninitialized as u8),
            status: AtomicU8::new(HubStatus::empty().bits()),
            fw_version: AtomicU16::new(0xFFFF),
            debug: AtomicU8::new(config.debug_level as u8),
            force_upgrade: AtomicBool::new(config.force_upgrade),
            tcmd_passed: AtomicBool::new(false),
        };

        hub.hw.lock().gpios.acquire(&config.gpios)?;
        hub.insert_status(HubStatus::ATTACHED);
        hub.hw_reset()?;

        hub.fw_request.arm();
        info!("Registered M4 Sensor Hub");
        Ok(hub)
    }

    fn insert_status(&self, flags: HubStatus) {
        self.status.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn remove_status(&self, flags: HubStatus) {
        self.status.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Current status flags
    pub fn status(&self) -> HubStatus {
        HubStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    fn is_attached(&self) -> bool {
        self.status().contains(HubStatus::ATTACHED)
    }

    /// Drive the boot-select straps.
    ///
    /// Fails with [`Error::InvalidArgument`] when the hub is not attached or
    /// a boot GPIO is not owned.
    pub fn set_boot_mode(&self, mode: BootMode) -> Result<(), Error> {
        if !self.is_attached() {
            error!("set_boot_mode: hub not attached");
            return Err(Error::InvalidArgument);
        }
        select_boot_mode(&mut self.hw.lock().gpios, mode)
    }

    /// Reset the hub into its bootloader.
    ///
    /// Delays are minimums; the F401 variant needs a different boot mode and
    /// longer settle times.
    pub fn hw_reset(&self) -> Result<(), Error> {
        if !self.is_attached() {
            error!("hw_reset: hub not attached");
            return Err(Error::InvalidArgument);
        }
        let mut hw = self.hw.lock();
        let HwControl { gpios, timer } = &mut *hw;

        match self.variant {
            HubVariant::F401 => {
                select_boot_mode(gpios, BootMode::BootMode01)?;
                timer.sleep_range_us(5_000, 10_000);
                gpios.set(HubPin::Reset, Level::Low);
                timer.sleep_range_us(10_000, 12_000);
                gpios.set(HubPin::Reset, Level::High);
                timer.sleep_ms(400);
            }
            HubVariant::Standard => {
                select_boot_mode(gpios, BootMode::BootMode00)?;
                gpios.set(HubPin::Reset, Level::High);
                timer.sleep_range_us(5_000, 10_000);
                gpios.set(HubPin::Reset, Level::Low);
                timer.sleep_range_us(5_000, 10_000);
                gpios.set(HubPin::Reset, Level::High);
            }
        }
        Ok(())
    }

    /// Completion of the firmware request.
    ///
    /// Downloads `image`, brings up interrupt dispatch, runs every queued
    /// init call and switches to [`Mode::NormalMode`]. If the download fails
    /// the hub is reset back into its bootloader. Runs at most once per
    /// probe; later calls and calls after shutdown fail with
    /// [`Error::NotReady`].
    pub fn firmware_ready(&self, image: Option<&[u8]>) -> Result<(), Error> {
        if !self.fw_request.begin() {
            warn!("Firmware completion without an outstanding request");
            return Err(Error::NotReady);
        }
        let result = self.initialize(image);
        self.fw_request.finish();
        result
    }

    fn initialize(&self, image: Option<&[u8]>) -> Result<(), Error> {
        let Some(image) = image else {
            error!("No firmware data received");
            return Err(FirmwareError::NoImage.into());
        };

        self.set_mode(Mode::BootMode);
        let force = self.force_upgrade.load(Ordering::Acquire);
        info!("Starting firmware download with force_upgrade = {}", force);

        let loaded = {
            let mut bus = self.bus.lock();
            self.firmware.lock().load(&mut *bus, Some(image), force)
        };
        match loaded {
            Ok(version) => {
                self.set_firmware_version(version);
                self.insert_status(HubStatus::FIRMWARE_LOADED);
            }
            Err(e) => {
                error!("Failed to load M4 firmware: {:?}", e);
                if let Err(e) = self.hw_reset() {
                    error!("Failed to return hub to boot mode: {:?}", e);
                }
                return Err(e.into());
            }
        }

        if let Err(e) = self.irq_init() {
            error!("M4sensorhub irq init failed: {:?}", e);
            return Err(e);
        }

        self.drain_initcalls();
        self.set_mode(Mode::NormalMode);
        Ok(())
    }

    /// Detach from the hub.
    ///
    /// Waits out a running firmware completion or cancels a pending one,
    /// tears down the registries, resets the hub and releases the GPIOs.
    pub fn shutdown(&self) {
        info!("Removing M4 Sensor Hub Driver");
        self.fw_request.cancel_and_wait();
        self.irq_shutdown();
        self.panic_shutdown();
        if let Err(e) = self.hw_reset() {
            error!("Hub reset at shutdown failed: {:?}", e);
        }
        self.hw.lock().gpios.release();
        self.remove_status(HubStatus::ATTACHED);
        self.set_mode(Mode::Uninitialized);
    }

    /// Tell the hub the host is going to sleep
    pub fn suspend(&self) {
        let _pm = self.pm.lock();
        info!("M4 sensor hub suspend");
        self.irq_pm_dbg_suspend();
        self.set_screen_status(0x00);
        self.insert_status(HubStatus::SUSPENDED);
    }

    /// Tell the hub the host is awake again. Returns the sources that fired
    /// while suspended.
    pub fn resume(&self) -> IrqSet {
        let _pm = self.pm.lock();
        info!("M4 sensor hub resume");
        let woke = self.irq_pm_dbg_resume();
        self.set_screen_status(0x01);
        self.remove_status(HubStatus::SUSPENDED);
        woke
    }

    fn set_screen_status(&self, value: u8) {
        match self.reg_write_1byte(Register::UserSettingsScreenStatus, value, 0xFF) {
            Ok(1) => {}
            _ => error!("Unable to set screen status to {:#x}", value),
        }
    }

    /// Run a factory test command and read back `response_len` bytes.
    ///
    /// The command passes when the first response byte is `0x00`; see
    /// [`SensorHub::tcmd_passed`].
    pub fn execute_tcmd(&self, opcode: u8, subopcode: u8, response_len: usize) -> Result<TcmdResponse, Error> {
        self.tcmd_passed.store(false, Ordering::Release);

        let mut response = TcmdResponse::new();
        response
            .resize_default(response_len)
            .map_err(|()| Error::InvalidArgument)?;

        let count = self
            .i2c_write_read(&[bank::TCMD, opcode, subopcode], &mut response)
            .map_err(|e| {
                error!("m4sensorhub tcmd i2c failed");
                e
            })?;
        if count != response_len {
            error!("m4sensorhub tcmd wrong num bytes read");
            return Err(Error::BadExchange);
        }

        if self.debug_level() >= DebugLevel::Info {
            for byte in response.iter() {
                info!("{:#x} ", byte);
            }
        }
        if response.first() == Some(&0x00) {
            self.tcmd_passed.store(true, Ordering::Release);
        }
        Ok(response)
    }

    /// Whether the last test command passed
    pub fn tcmd_passed(&self) -> bool {
        self.tcmd_passed.load(Ordering::Acquire)
    }

    /// Set the driver debug level, 0 to 7
    pub fn set_debug_level(&self, level: u8) -> Result<(), Error> {
        let level = DebugLevel::try_from(level)?;
        self.debug.store(level as u8, Ordering::Release);
        info!("M4 Sensor Hub debug level = {}", level as u8);
        Ok(())
    }

    /// Current driver debug level
    pub fn debug_level(&self) -> DebugLevel {
        DebugLevel::try_from(self.debug.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Packed per-tag log levels of the hub firmware
    pub fn hub_log_levels(&self) -> Result<u64, Error> {
        let levels = le_value(&self.reg_read(Register::LogLogEnable)?);
        info!("M4 loglevel = {:#x}", levels);
        Ok(levels)
    }

    /// Apply a `TAG=LEVEL[,TAG=LEVEL..]` string to the hub firmware log
    /// levels. Unknown tags and levels are skipped.
    pub fn set_hub_log_levels(&self, input: &str) -> Result<(), Error> {
        let mut bus = self.bus.lock();
        let current = le_value(&bus.read_register(Register::LogLogEnable)?);
        let updated = apply_log_levels(current, input);
        bus.write_register(Register::LogLogEnable, &updated.to_le_bytes(), Mask::All)?;
        Ok(())
    }

    /// Running firmware version, `0xFFFF` unless in normal mode
    pub fn firmware_version(&self) -> u16 {
        if self.mode() == Mode::NormalMode {
            self.fw_version.load(Ordering::Acquire)
        } else {
            0xFFFF
        }
    }

    pub(crate) fn set_firmware_version(&self, version: u16) {
        self.fw_version.store(version, Ordering::Release);
    }

    /// Whether the firmware is downloaded and running
    pub fn download_complete(&self) -> bool {
        self.mode() == Mode::NormalMode
    }

    /// Current operating mode
    pub fn mode(&self) -> Mode {
        Mode::from_raw(self.mode.load(Ordering::Acquire))
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// Flash on the next download even if the hub runs the same version
    pub fn set_force_upgrade(&self, force: bool) {
        self.force_upgrade.store(force, Ordering::Release);
    }

    /// Whether the next download is forced
    pub fn force_upgrade(&self) -> bool {
        self.force_upgrade.load(Ordering::Acquire)
    }

    /// Firmware image name from [`Config`]
    pub fn firmware_name(&self) -> &str {
        &self.firmware_name
    }

    /// GPIOs currently owned by the hub
    pub fn hw_config(&self) -> HwConfig {
        *self.hw.lock().gpios.config()
    }

    /// Board variant, from the configured address
    pub fn variant(&self) -> HubVariant {
        self.variant
    }
}

fn select_boot_mode<G: GpioController>(gpios: &mut HubGpios<G>, mode: BootMode) -> Result<(), Error> {
    if gpios.select_boot_mode(mode) {
        Ok(())
    } else {
        error!("Failed to select {:?}: boot GPIOs not owned", mode);
        Err(Error::InvalidArgument)
    }
}
