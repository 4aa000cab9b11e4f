//! GPIO control for the M4 sensor hub
//!
//! The hub is wired to the host with six GPIOs: an interrupt line, reset,
//! wake, two boot-source selects and the MPU9150 enable. They are acquired as a
//! group at attach time and released as a group at detach.

/// GPIO line level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    /// Driven low
    Low,
    /// Driven high
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// GPIO controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpioError {
    /// Line is already owned by someone else
    Busy,
    /// Line number does not exist on this controller
    InvalidPin,
    /// Direction could not be configured
    Direction,
}

/// Board GPIO controller, addressed by GPIO number.
pub trait GpioController {
    /// Claim exclusive ownership of `gpio`
    fn request(&mut self, gpio: u32, label: &'static str) -> Result<(), GpioError>;

    /// Release a line obtained with [`GpioController::request`]
    fn free(&mut self, gpio: u32);

    /// Configure `gpio` as an input
    fn direction_input(&mut self, gpio: u32) -> Result<(), GpioError>;

    /// Configure `gpio` as an output driving `level`
    fn direction_output(&mut self, gpio: u32, level: Level) -> Result<(), GpioError>;

    /// Drive an output line
    fn set_value(&mut self, gpio: u32, level: Level);
}

/// Hub-facing GPIO lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HubPin {
    /// Hub interrupt line, input
    Irq,
    /// Hub reset, active low
    Reset,
    /// Wakes the hub from stop mode
    Wake,
    /// Boot-source select, bit 0
    Boot0,
    /// Boot-source select, bit 1
    Boot1,
    /// MPU9150 power enable
    Enable,
}

impl HubPin {
    /// Acquisition order; release happens in reverse.
    pub const ALL: [HubPin; 6] = [
        HubPin::Irq,
        HubPin::Reset,
        HubPin::Wake,
        HubPin::Boot0,
        HubPin::Boot1,
        HubPin::Enable,
    ];

    /// Label passed to the GPIO controller
    pub const fn label(self) -> &'static str {
        match self {
            HubPin::Irq => "m4sensorhub-intr",
            HubPin::Reset => "m4sensorhub-reset",
            HubPin::Wake => "m4sensorhub-wake",
            HubPin::Boot0 => "m4sensorhub-boot0",
            HubPin::Boot1 => "m4sensorhub-boot1",
            HubPin::Enable => "m4sensorhub-enable",
        }
    }

    /// Direction and initial level once acquired; `None` means input.
    const fn initial_output(self) -> Option<Level> {
        match self {
            HubPin::Irq => None,
            HubPin::Reset => Some(Level::High),
            HubPin::Wake | HubPin::Boot0 | HubPin::Boot1 | HubPin::Enable => Some(Level::Low),
        }
    }
}

/// GPIO numbers as described by the board configuration.
///
/// `None` means the lookup failed for that line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpioMap {
    /// Hub interrupt line
    pub irq: Option<u32>,
    /// Hub reset
    pub reset: Option<u32>,
    /// Hub wake
    pub wake: Option<u32>,
    /// Boot-source select 0
    pub boot0: Option<u32>,
    /// Boot-source select 1
    pub boot1: Option<u32>,
    /// MPU9150 enable
    pub enable: Option<u32>,
}

impl GpioMap {
    fn get(&self, pin: HubPin) -> Option<u32> {
        match pin {
            HubPin::Irq => self.irq,
            HubPin::Reset => self.reset,
            HubPin::Wake => self.wake,
            HubPin::Boot0 => self.boot0,
            HubPin::Boot1 => self.boot1,
            HubPin::Enable => self.enable,
        }
    }
}

/// GPIOs currently owned by the hub. `None` is the unassigned sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwConfig {
    /// Interrupt line
    pub irq_gpio: Option<u32>,
    /// Reset line
    pub reset_gpio: Option<u32>,
    /// Wake line
    pub wake_gpio: Option<u32>,
    /// Boot select 0
    pub boot0_gpio: Option<u32>,
    /// Boot select 1
    pub boot1_gpio: Option<u32>,
    /// MPU9150 enable
    pub mpu_9150_en_gpio: Option<u32>,
}

impl HwConfig {
    /// Stored GPIO number for `pin`
    pub fn gpio(&self, pin: HubPin) -> Option<u32> {
        match pin {
            HubPin::Irq => self.irq_gpio,
            HubPin::Reset => self.reset_gpio,
            HubPin::Wake => self.wake_gpio,
            HubPin::Boot0 => self.boot0_gpio,
            HubPin::Boot1 => self.boot1_gpio,
            HubPin::Enable => self.mpu_9150_en_gpio,
        }
    }

    fn slot_mut(&mut self, pin: HubPin) -> &mut Option<u32> {
        match pin {
            HubPin::Irq => &mut self.irq_gpio,
            HubPin::Reset => &mut self.reset_gpio,
            HubPin::Wake => &mut self.wake_gpio,
            HubPin::Boot0 => &mut self.boot0_gpio,
            HubPin::Boot1 => &mut self.boot1_gpio,
            HubPin::Enable => &mut self.mpu_9150_en_gpio,
        }
    }
}

/// Why acquiring the hub GPIO group failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AcquireError {
    /// The board configuration has no GPIO for this line
    Missing(HubPin),
    /// The controller refused the request
    Controller(HubPin, GpioError),
}

/// Boot source selected by the boot0/boot1 straps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootMode {
    /// boot0 low, boot1 low: main flash
    BootMode00,
    /// boot0 high, boot1 low: system bootloader
    BootMode01,
    /// boot0 low, boot1 high
    BootMode10,
    /// boot0 high, boot1 high
    BootMode11,
}

impl BootMode {
    /// `(boot0, boot1)` levels for this mode
    pub const fn levels(self) -> (Level, Level) {
        match self {
            BootMode::BootMode00 => (Level::Low, Level::Low),
            BootMode::BootMode01 => (Level::High, Level::Low),
            BootMode::BootMode10 => (Level::Low, Level::High),
            BootMode::BootMode11 => (Level::High, Level::High),
        }
    }
}

/// The hub's GPIO group on top of a board controller
pub struct HubGpios<G> {
    controller: G,
    config: HwConfig,
}

impl<G: GpioController> HubGpios<G> {
    /// Wrap a controller; no lines are owned yet
    pub const fn new(controller: G) -> Self {
        Self {
            controller,
            config: HwConfig {
                irq_gpio: None,
                reset_gpio: None,
                wake_gpio: None,
                boot0_gpio: None,
                boot1_gpio: None,
                mpu_9150_en_gpio: None,
            },
        }
    }

    /// Currently owned lines
    pub fn config(&self) -> &HwConfig {
        &self.config
    }

    /// Access the board controller
    pub fn controller_mut(&mut self) -> &mut G {
        &mut self.controller
    }

    /// Acquire every hub GPIO in [`HubPin::ALL`] order.
    ///
    /// On failure, lines acquired during this attempt are freed in reverse
    /// order and their fields reset to `None` before the error is returned.
    pub fn acquire(&mut self, map: &GpioMap) -> Result<(), AcquireError> {
        for (index, &pin) in HubPin::ALL.iter().enumerate() {
            if let Err(e) = self.acquire_one(map, pin) {
                match e {
                    AcquireError::Missing(pin) => {
                        error!("No M4 sensor hub GPIO configured for {}", pin.label())
                    }
                    AcquireError::Controller(pin, err) => {
                        error!("Failed acquiring M4 sensor hub GPIO {} ({:?})", pin.label(), err)
                    }
                }
                for &acquired in HubPin::ALL[..index].iter().rev() {
                    self.release_one(acquired);
                }
                return Err(e);
            }
        }
        debug!("M4 sensor hub GPIOs acquired");
        Ok(())
    }

    fn acquire_one(&mut self, map: &GpioMap, pin: HubPin) -> Result<(), AcquireError> {
        let gpio = map.get(pin).ok_or(AcquireError::Missing(pin))?;
        self.controller
            .request(gpio, pin.label())
            .map_err(|e| AcquireError::Controller(pin, e))?;

        let direction = match pin.initial_output() {
            None => self.controller.direction_input(gpio),
            Some(level) => self.controller.direction_output(gpio, level),
        };
        if let Err(e) = direction {
            self.controller.free(gpio);
            return Err(AcquireError::Controller(pin, e));
        }

        *self.config.slot_mut(pin) = Some(gpio);
        Ok(())
    }

    fn release_one(&mut self, pin: HubPin) {
        if let Some(gpio) = self.config.slot_mut(pin).take() {
            self.controller.free(gpio);
        }
    }

    /// Release every owned line. Lines already released are skipped.
    pub fn release(&mut self) {
        for &pin in HubPin::ALL.iter() {
            self.release_one(pin);
        }
    }

    /// Drive an owned output line. Returns `false` if `pin` is unassigned.
    pub fn set(&mut self, pin: HubPin, level: Level) -> bool {
        match self.config.gpio(pin) {
            Some(gpio) => {
                self.controller.set_value(gpio, level);
                true
            }
            None => false,
        }
    }

    /// Drive boot0 then boot1 to select `mode`.
    ///
    /// Returns `false` without touching either line if a boot GPIO is not
    /// owned.
    pub fn select_boot_mode(&mut self, mode: BootMode) -> bool {
        let (Some(boot0), Some(boot1)) = (self.config.boot0_gpio, self.config.boot1_gpio) else {
            return false;
        };
        let (level0, level1) = mode.levels();
        self.controller.set_value(boot0, level0);
        self.controller.set_value(boot1, level1);
        true
    }
}
