//! Firmware download seam
//!
//! Flashing the hub is the job of a [`FirmwareLoader`]; the core only decides
//! when to call it. The image arrives asynchronously after probe, so the
//! request is tracked by [`FirmwareRequest`] to keep teardown from racing the
//! completion path.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::hal::i2c::{HubBus, Transport, TransportError};

/// Firmware download errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FirmwareError {
    /// No image was supplied and none is held for a reload
    NoImage,
    /// The hub bootloader refused the image
    Rejected,
    /// Read-back after flashing did not match
    Verify,
    /// Transport failure while flashing
    Transport(TransportError),
}

impl From<TransportError> for FirmwareError {
    fn from(e: TransportError) -> Self {
        FirmwareError::Transport(e)
    }
}

/// Flashes firmware onto a hub sitting in boot mode.
pub trait FirmwareLoader {
    /// Download `image` over `bus` and return the running firmware version.
    ///
    /// `None` re-flashes the image the loader already holds. With
    /// `force_upgrade` set the image is written even if the hub reports the
    /// same version. The caller holds the register access lock.
    fn load<T: Transport>(
        &mut self,
        bus: &mut HubBus<T>,
        image: Option<&[u8]>,
        force_upgrade: bool,
    ) -> Result<u16, FirmwareError>;
}

/// Lifecycle of the asynchronous firmware request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RequestState {
    /// No request armed
    Idle,
    /// Armed, waiting for the image
    Pending,
    /// Image received, download in progress
    Running,
    /// Completion finished
    Done,
    /// Detach cancelled the request before it completed
    Cancelled,
}

impl RequestState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => RequestState::Pending,
            2 => RequestState::Running,
            3 => RequestState::Done,
            4 => RequestState::Cancelled,
            _ => RequestState::Idle,
        }
    }
}

/// Tracks the outstanding firmware request.
///
/// `Idle -> Pending -> Running -> Done`, with `Cancelled` reachable from
/// `Pending` at teardown. A cancelled request never starts running.
pub struct FirmwareRequest {
    state: AtomicU8,
}

impl FirmwareRequest {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(RequestState::Idle as u8),
        }
    }

    /// Current state
    pub fn state(&self) -> RequestState {
        RequestState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: RequestState, to: RequestState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark a request as outstanding. Any finished or cancelled request may
    /// be re-armed.
    pub(crate) fn arm(&self) -> bool {
        match self.state() {
            RequestState::Pending | RequestState::Running => false,
            from => self.transition(from, RequestState::Pending),
        }
    }

    /// Claim the request for the completion path. Fails once cancelled.
    pub(crate) fn begin(&self) -> bool {
        self.transition(RequestState::Pending, RequestState::Running)
    }

    pub(crate) fn finish(&self) {
        self.transition(RequestState::Running, RequestState::Done);
    }

    /// Make sure the completion path is not running and will not start.
    pub(crate) fn cancel_and_wait(&self) {
        if self.transition(RequestState::Pending, RequestState::Cancelled) {
            debug!("Cancelled pending firmware request");
            return;
        }
        while self.state() == RequestState::Running {
            core::hint::spin_loop();
        }
        self.state.store(RequestState::Cancelled as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn request_runs_once_per_arm() {
        let request = FirmwareRequest::new();
        assert!(!request.begin());
        assert!(request.arm());
        assert!(!request.arm());
        assert!(request.begin());
        assert!(!request.begin());
        request.finish();
        assert_eq!(request.state(), RequestState::Done);
        assert!(request.arm());
    }

    #[test]
    fn cancelled_request_never_starts() {
        let request = FirmwareRequest::new();
        request.arm();
        request.cancel_and_wait();
        assert_eq!(request.state(), RequestState::Cancelled);
        assert!(!request.begin());
    }

    #[test]
    fn cancel_waits_for_a_running_completion() {
        let request = Arc::new(FirmwareRequest::new());
        request.arm();
        assert!(request.begin());

        let worker = {
            let request = request.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                request.finish();
            })
        };
        request.cancel_and_wait();
        assert_eq!(request.state(), RequestState::Cancelled);
        worker.join().unwrap();
    }
}
