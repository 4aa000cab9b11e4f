//! Deferred client initialization
//!
//! Client drivers cannot touch the hub until its firmware is running. They
//! queue an [`InitCall`] instead, and the core drains the queue once the
//! firmware download and interrupt setup have succeeded. Each entry runs at
//! most once and is dropped as soon as it has run.
//!
//! Entries run last-registered first.

use heapless::Vec;

use crate::sensorhub::{Error, Platform, SensorHub};

/// Most init calls that can be queued at once
pub const MAX_INIT_CALLS: usize = 16;

/// A one-shot hook run after the hub firmware is ready.
///
/// The hook object is its own context; it receives the hub it was queued on.
pub trait InitCall<P: Platform>: Sync {
    /// Bring the client up against a running hub
    fn init(&self, hub: &SensorHub<P>) -> Result<(), Error>;
}

/// Queue of pending init calls
pub struct InitCallRegistry<P: Platform> {
    calls: spin::Mutex<Vec<&'static dyn InitCall<P>, MAX_INIT_CALLS>>,
}

impl<P: Platform> InitCallRegistry<P> {
    pub(crate) const fn new() -> Self {
        Self {
            calls: spin::Mutex::new(Vec::new()),
        }
    }

    /// Number of queued calls
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

fn same_call<P: Platform>(a: &'static dyn InitCall<P>, b: &'static dyn InitCall<P>) -> bool {
    core::ptr::addr_eq(a, b)
}

impl<P: Platform> SensorHub<P> {
    /// Queue `call` to run once the hub firmware is ready.
    ///
    /// The same hook object may only be queued once
    /// ([`Error::PermissionDenied`]); a full queue fails with
    /// [`Error::OutOfMemory`].
    pub fn register_initcall(&self, call: &'static dyn InitCall<P>) -> Result<(), Error> {
        let mut calls = self.init_calls.calls.lock();
        if calls.iter().any(|queued| same_call(*queued, call)) {
            error!("Init call is already queued");
            return Err(Error::PermissionDenied);
        }
        calls.push(call).map_err(|_| {
            error!("Unable to allocate for init call");
            Error::OutOfMemory
        })
    }

    /// Remove `call` from the queue. Unknown hooks are ignored.
    pub fn unregister_initcall(&self, call: &'static dyn InitCall<P>) {
        let mut calls = self.init_calls.calls.lock();
        if let Some(pos) = calls.iter().position(|queued| same_call(*queued, call)) {
            calls.remove(pos);
        }
    }

    /// Pending init calls
    pub fn init_calls(&self) -> &InitCallRegistry<P> {
        &self.init_calls
    }

    /// Run and drop every queued init call, newest first.
    ///
    /// A failing call is logged and the drain carries on. Returns how many
    /// calls failed.
    pub(crate) fn drain_initcalls(&self) -> usize {
        let mut failed = 0;
        loop {
            // pop under the lock, run without it: calls may queue more calls
            let Some(call) = self.init_calls.calls.lock().pop() else {
                break;
            };
            if let Err(e) = call.init(self) {
                error!("M4 sensor hub init call failed: {:?}", e);
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{probed_hub, MockPlatform, Recorder};

    struct Client {
        name: &'static str,
        log: &'static Recorder,
        result: Result<(), Error>,
    }

    impl InitCall<MockPlatform> for Client {
        fn init(&self, _hub: &SensorHub<MockPlatform>) -> Result<(), Error> {
            self.log.push(self.name);
            self.result
        }
    }

    fn client(name: &'static str, log: &'static Recorder, result: Result<(), Error>) -> &'static Client {
        Box::leak(Box::new(Client { name, log, result }))
    }

    #[test]
    fn drain_runs_newest_first_exactly_once() {
        let (hub, _mock) = probed_hub();
        let log = Recorder::leak();
        hub.register_initcall(client("a", log, Err(Error::NoDevice))).unwrap();
        hub.register_initcall(client("b", log, Ok(()))).unwrap();

        assert_eq!(hub.drain_initcalls(), 1);
        assert_eq!(log.take(), vec!["b", "a"]);
        assert!(hub.init_calls().is_empty());

        assert_eq!(hub.drain_initcalls(), 0);
        assert!(log.take().is_empty());
    }

    #[test]
    fn duplicate_hook_is_refused() {
        let (hub, _mock) = probed_hub();
        let log = Recorder::leak();
        let a = client("a", log, Ok(()));
        hub.register_initcall(a).unwrap();
        assert_eq!(hub.register_initcall(a), Err(Error::PermissionDenied));
        assert_eq!(hub.init_calls().len(), 1);
    }

    #[test]
    fn unregister_removes_only_that_hook() {
        let (hub, _mock) = probed_hub();
        let log = Recorder::leak();
        let a = client("a", log, Ok(()));
        let b = client("b", log, Ok(()));
        hub.register_initcall(a).unwrap();
        hub.register_initcall(b).unwrap();

        hub.unregister_initcall(a);
        hub.unregister_initcall(a);
        hub.drain_initcalls();
        assert_eq!(log.take(), vec!["b"]);
    }

    #[test]
    fn full_queue_reports_out_of_memory() {
        let (hub, _mock) = probed_hub();
        let log = Recorder::leak();
        for _ in 0..MAX_INIT_CALLS {
            hub.register_initcall(client("x", log, Ok(()))).unwrap();
        }
        assert_eq!(
            hub.register_initcall(client("y", log, Ok(()))),
            Err(Error::OutOfMemory)
        );
    }
}
