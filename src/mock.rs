//! Simulated board for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::vec::Vec;

use embedded_hal::delay::DelayNs;

use crate::firmware::{FirmwareError, FirmwareLoader};
use crate::hal::gpio::{GpioController, GpioError, GpioMap, Level};
use crate::hal::i2c::{
    HubBus, Transport, TransportError, M4SENSORHUB_F401_I2C_ADDR, M4SENSORHUB_I2C_ADDR,
};
use crate::irq::IrqSet;
use crate::panic::{PANIC_BANK, PANIC_NACK, PANIC_RESP_CHECK};
use crate::registers::{bank, le_value, Register};
use crate::sensorhub::{Config, Error, Platform, SensorHub};

/// Board GPIO numbers used by every test hub
pub const FULL_MAP: GpioMap = GpioMap {
    irq: Some(10),
    reset: Some(11),
    wake: Some(12),
    boot0: Some(13),
    boot1: Some(14),
    enable: Some(15),
};

/// Version reported by the simulated firmware
pub const MOCK_FW_VERSION: u16 = 0x0412;

const FIRMWARE_IMAGE: &[u8] = b"m4 firmware image";

/// One transfer seen by the simulated hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Write(Vec<u8>),
    WriteRead(Vec<u8>, usize),
}

/// How the simulated hub answers the panic bank
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PanicAnswer {
    /// Normal firmware: a single NACK byte
    #[default]
    Nack,
    /// Panic handler: the 4-byte magic
    Magic,
    Bytes(Vec<u8>),
}

#[derive(Default)]
struct HubState {
    memory: HashMap<(u8, u8), u8>,
    transfers: Vec<Transfer>,
    panic_answer: PanicAnswer,
    panic_checked: bool,
    short_reads: Option<usize>,
    short_writes: bool,
    failing_write: Option<(u8, u8)>,
    tcmd: Vec<u8>,
}

impl HubState {
    fn store(&mut self, bank: u8, offset: u8, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            self.memory.insert((bank, offset.wrapping_add(i as u8)), byte);
        }
    }

    fn load(&self, bank: u8, offset: u8, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self
                .memory
                .get(&(bank, offset.wrapping_add(i as u8)))
                .copied()
                .unwrap_or(0);
        }
    }
}

fn is_status(bank: u8, offset: u8) -> bool {
    [Register::GeneralInterrupt0Status, Register::GeneralInterrupt1Status]
        .iter()
        .any(|reg| reg.info().bank == bank && reg.info().offset == offset)
}

fn answer(bytes: &[u8], response: &mut [u8]) -> usize {
    let count = bytes.len().min(response.len());
    response[..count].copy_from_slice(&bytes[..count]);
    count
}

/// Register file and firmware behaviour of a hub
#[derive(Clone, Default)]
pub struct MockHub {
    state: Arc<Mutex<HubState>>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap()
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport { hub: self.clone() }
    }

    /// Set register contents without any bus traffic
    pub fn poke(&self, reg: Register, value: &[u8]) {
        assert_eq!(value.len(), reg.size());
        let info = reg.info();
        self.state().store(info.bank, info.offset, value);
    }

    /// Read register contents without any bus traffic
    pub fn peek(&self, reg: Register) -> Vec<u8> {
        let info = reg.info();
        let mut value = vec![0; info.size];
        self.state().load(info.bank, info.offset, &mut value);
        value
    }

    /// Latch `pending` into the interrupt status registers
    pub fn raise(&self, pending: IrqSet) {
        let bits = pending.bits();
        self.poke(Register::GeneralInterrupt0Status, &[bits as u8]);
        self.poke(Register::GeneralInterrupt1Status, &[(bits >> 8) as u8]);
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.state().transfers.clone()
    }

    pub fn panic_answer(&self, answer: PanicAnswer) {
        self.state().panic_answer = answer;
    }

    /// Whether the panic bank has been asked since the hub was created
    pub fn panic_checked(&self) -> bool {
        self.state().panic_checked
    }

    /// Cap the bytes returned by register reads
    pub fn short_reads(&self, count: Option<usize>) {
        self.state().short_reads = count;
    }

    /// Accept one byte less than written
    pub fn short_writes(&self, short: bool) {
        self.state().short_writes = short;
    }

    /// NACK writes to `reg`
    pub fn fail_writes_to(&self, reg: Register) {
        let info = reg.info();
        self.state().failing_write = Some((info.bank, info.offset));
    }

    pub fn fail_writes_to_none(&self) {
        self.state().failing_write = None;
    }

    /// Bytes the test-command bank answers with
    pub fn tcmd_response(&self, response: Vec<u8>) {
        self.state().tcmd = response;
    }
}

/// [`Transport`] into a [`MockHub`]
pub struct MockTransport {
    hub: MockHub,
}

impl Transport for MockTransport {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<usize, TransportError> {
        assert!(bytes.len() >= 2, "register writes carry bank and offset");
        let mut state = self.hub.state();
        state.transfers.push(Transfer::Write(bytes.to_vec()));
        if address != M4SENSORHUB_I2C_ADDR && address != M4SENSORHUB_F401_I2C_ADDR {
            return Err(TransportError::AddressNack);
        }
        if state.failing_write == Some((bytes[0], bytes[1])) {
            return Err(TransportError::DataNack);
        }
        if state.short_writes {
            return Ok(bytes.len() - 1);
        }
        state.store(bytes[0], bytes[1], &bytes[2..]);
        Ok(bytes.len())
    }

    fn write_read(
        &mut self,
        _address: u8,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, TransportError> {
        let mut state = self.hub.state();
        state.transfers.push(Transfer::WriteRead(request.to_vec(), response.len()));

        let bank_id = request[0];
        if bank_id == PANIC_BANK {
            state.panic_checked = true;
            let count = match &state.panic_answer {
                PanicAnswer::Nack => answer(&[PANIC_NACK], response),
                PanicAnswer::Magic => answer(&PANIC_RESP_CHECK.to_le_bytes(), response),
                PanicAnswer::Bytes(bytes) => answer(bytes, response),
            };
            return Ok(count);
        }
        if bank_id == bank::TCMD {
            let script = state.tcmd.clone();
            return Ok(answer(&script, response));
        }
        if bank_id >= bank::NUM {
            return Ok(answer(&[PANIC_NACK], response));
        }

        let offset = request[1];
        state.load(bank_id, offset, response);
        if is_status(bank_id, offset) {
            state.store(bank_id, offset, &[0]);
        }
        Ok(state.short_reads.map_or(response.len(), |n| n.min(response.len())))
    }
}

/// Something the GPIO controller was asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioEvent {
    Request(u32),
    Free(u32),
    Input(u32),
    Output(u32, Level),
    Set(u32, Level),
}

#[derive(Default)]
struct GpioState {
    events: Vec<GpioEvent>,
    owned: Vec<u32>,
    refused: Vec<u32>,
}

/// [`GpioController`] that records every call
#[derive(Clone, Default)]
pub struct RecordingGpio {
    state: Arc<Mutex<GpioState>>,
}

impl RecordingGpio {
    fn state(&self) -> std::sync::MutexGuard<'_, GpioState> {
        self.state.lock().unwrap()
    }

    pub fn events(&self) -> Vec<GpioEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Lines currently requested, in request order
    pub fn owned(&self) -> Vec<u32> {
        self.state().owned.clone()
    }

    /// Make requests for `gpio` fail as busy
    pub fn refuse(&self, gpio: u32) {
        self.state().refused.push(gpio);
    }

    /// Whether the reset line was driven low and then high again
    pub fn reset_toggled(&self) -> bool {
        let Some(reset) = FULL_MAP.reset else {
            return false;
        };
        let events = self.events();
        events
            .iter()
            .position(|e| *e == GpioEvent::Set(reset, Level::Low))
            .is_some_and(|low| events[low..].contains(&GpioEvent::Set(reset, Level::High)))
    }
}

impl GpioController for RecordingGpio {
    fn request(&mut self, gpio: u32, _label: &'static str) -> Result<(), GpioError> {
        let mut state = self.state();
        if state.refused.contains(&gpio) || state.owned.contains(&gpio) {
            return Err(GpioError::Busy);
        }
        state.events.push(GpioEvent::Request(gpio));
        state.owned.push(gpio);
        Ok(())
    }

    fn free(&mut self, gpio: u32) {
        let mut state = self.state();
        state.events.push(GpioEvent::Free(gpio));
        state.owned.retain(|&owned| owned != gpio);
    }

    fn direction_input(&mut self, gpio: u32) -> Result<(), GpioError> {
        self.state().events.push(GpioEvent::Input(gpio));
        Ok(())
    }

    fn direction_output(&mut self, gpio: u32, level: Level) -> Result<(), GpioError> {
        self.state().events.push(GpioEvent::Output(gpio, level));
        Ok(())
    }

    fn set_value(&mut self, gpio: u32, level: Level) {
        self.state().events.push(GpioEvent::Set(gpio, level));
    }
}

/// [`DelayNs`] that only adds up the requested time
#[derive(Clone, Default)]
pub struct RecordingDelay {
    total_ns: Arc<AtomicU64>,
}

impl RecordingDelay {
    pub fn total_us(&self) -> u64 {
        self.total_ns.load(Ordering::SeqCst) / 1_000
    }
}

impl DelayNs for RecordingDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns.fetch_add(u64::from(ns), Ordering::SeqCst);
    }
}

#[derive(Default)]
struct LoaderState {
    loads: Vec<(bool, bool)>,
    fail_next: bool,
    wipe: Vec<Register>,
    image: Option<Vec<u8>>,
}

/// [`FirmwareLoader`] that "flashes" by restarting the simulated hub
#[derive(Clone)]
pub struct ScriptedLoader {
    hub: MockHub,
    state: Arc<Mutex<LoaderState>>,
}

impl ScriptedLoader {
    pub fn new(hub: MockHub) -> Self {
        Self {
            hub,
            state: Arc::default(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap()
    }

    /// `(image supplied, force_upgrade)` for every load so far
    pub fn loads(&self) -> Vec<(bool, bool)> {
        self.state().loads.clone()
    }

    /// Reject the next load
    pub fn fail_next(&self) {
        self.state().fail_next = true;
    }

    /// Zero `reg` whenever the hub restarts
    pub fn wipe_on_load(&self, reg: Register) {
        self.state().wipe.push(reg);
    }
}

impl FirmwareLoader for ScriptedLoader {
    fn load<T: Transport>(
        &mut self,
        bus: &mut HubBus<T>,
        image: Option<&[u8]>,
        force_upgrade: bool,
    ) -> Result<u16, FirmwareError> {
        let wipe = {
            let mut state = self.state();
            state.loads.push((image.is_some(), force_upgrade));
            if std::mem::take(&mut state.fail_next) {
                return Err(FirmwareError::Rejected);
            }
            match image {
                Some(image) => state.image = Some(image.to_vec()),
                None if state.image.is_none() => return Err(FirmwareError::NoImage),
                None => {}
            }
            state.wipe.clone()
        };

        for reg in wipe {
            self.hub.poke(reg, &vec![0; reg.size()]);
        }
        self.hub.panic_answer(PanicAnswer::Nack);
        self.hub
            .poke(Register::GeneralFirmwareVersion, &MOCK_FW_VERSION.to_le_bytes());

        let version = bus
            .read_register(Register::GeneralFirmwareVersion)
            .map_err(|_| FirmwareError::Verify)?;
        Ok(le_value(&version) as u16)
    }
}

/// Board types of the simulated platform
pub struct MockPlatform;

impl Platform for MockPlatform {
    type Transport = MockTransport;
    type Gpio = RecordingGpio;
    type Delay = RecordingDelay;
    type Firmware = ScriptedLoader;
}

/// Handles on the simulated board behind a test hub
pub struct Mocks {
    pub hub: MockHub,
    pub gpio: RecordingGpio,
    pub delay: RecordingDelay,
    pub loader: ScriptedLoader,
}

pub fn mocks() -> Mocks {
    let hub = MockHub::new();
    Mocks {
        loader: ScriptedLoader::new(hub.clone()),
        hub,
        gpio: RecordingGpio::default(),
        delay: RecordingDelay::default(),
    }
}

pub fn test_config() -> Config {
    Config::new("m4sensorhub.bin", FULL_MAP).unwrap()
}

pub fn probe(config: Config, mocks: &Mocks) -> Result<SensorHub<MockPlatform>, Error> {
    SensorHub::probe(
        config,
        mocks.hub.transport(),
        mocks.gpio.clone(),
        mocks.delay.clone(),
        mocks.loader.clone(),
    )
}

/// A hub that has been probed but has not received its firmware yet
pub fn probed_hub() -> (SensorHub<MockPlatform>, Mocks) {
    let mocks = mocks();
    let hub = probe(test_config(), &mocks).unwrap();
    (hub, mocks)
}

/// A hub running firmware in normal mode
pub fn attached_hub() -> (SensorHub<MockPlatform>, Mocks) {
    let (hub, mocks) = probed_hub();
    hub.firmware_ready(Some(FIRMWARE_IMAGE)).unwrap();
    (hub, mocks)
}

/// Collects names from callbacks
#[derive(Default)]
pub struct Recorder {
    names: Mutex<Vec<&'static str>>,
}

impl Recorder {
    pub fn leak() -> &'static Recorder {
        Box::leak(Box::default())
    }

    pub fn push(&self, name: &'static str) {
        self.names.lock().unwrap().push(name);
    }

    pub fn take(&self) -> Vec<&'static str> {
        std::mem::take(&mut *self.names.lock().unwrap())
    }
}
