//! # Runtime Trap Registration
//!
//! VMs register their trap handlers while other virtual CPUs may already be dispatching
//! accesses. [`TrapTable`] keeps an immutable [`IoBus`] snapshot that readers load without
//! locking, and rebuilds it whenever a handler is registered or removed.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::device::bus::{AddTrapError, IoBus, IoHandlerRef, Request};

#[derive(Debug)]
struct TrapEntry {
    start_addr: u64,
    handler: IoHandlerRef,
}

/// A trap dispatch table that can grow at runtime.
#[derive(Debug)]
pub struct TrapTable {
    name: &'static str,
    size: u64,
    entries: Mutex<Vec<TrapEntry>>,
    device_model: Mutex<Option<IoHandlerRef>>,
    bus: ArcSwap<IoBus>,
}

impl TrapTable {
    /// Create an empty table that spans `size` addresses.
    #[must_use]
    pub fn new(name: &'static str, size: u64) -> Self {
        Self {
            name,
            size,
            entries: Mutex::default(),
            device_model: Mutex::default(),
            bus: ArcSwap::from_pointee(IoBus::new(name, size)),
        }
    }

    fn rebuild(
        &self,
        entries: &[TrapEntry],
        device_model: Option<&IoHandlerRef>,
    ) -> Result<IoBus, AddTrapError> {
        let mut new_bus = match device_model {
            Some(model) => IoBus::new_with_device_model(self.name, model.clone()),
            None => IoBus::new(self.name, self.size),
        };

        for entry in entries {
            new_bus.add(entry.start_addr, entry.handler.clone())?;
        }

        Ok(new_bus)
    }

    /// Register a handler for the range starting at `start_addr`.
    ///
    /// The table is left unchanged if the new handler collides with an existing one.
    pub fn add(&self, start_addr: u64, handler: IoHandlerRef) -> Result<(), AddTrapError> {
        let mut entries = self.entries.lock().unwrap();
        let device_model = self.device_model.lock().unwrap();

        entries.push(TrapEntry {
            start_addr,
            handler,
        });

        match self.rebuild(&entries, device_model.as_ref()) {
            Ok(new_bus) => {
                // It's okay to use store here, because we only have a single
                // writer (serialized by the mutex).
                self.bus.store(Arc::new(new_bus));
                Ok(())
            }
            Err(e) => {
                entries.pop();
                Err(e)
            }
        }
    }

    /// Drop the handler registered at `start_addr`. Returns whether there was one.
    pub fn remove(&self, start_addr: u64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let device_model = self.device_model.lock().unwrap();

        let Some(pos) = entries.iter().position(|e| e.start_addr == start_addr) else {
            return false;
        };
        entries.remove(pos);

        // The remaining entries were validated when they were added.
        let new_bus = self
            .rebuild(&entries, device_model.as_ref())
            .expect("Re-adding validated trap entries cannot fail");
        self.bus.store(Arc::new(new_bus));

        true
    }

    /// Install the external device model that receives unclaimed and declined requests.
    pub fn set_device_model(&self, model: IoHandlerRef) {
        let entries = self.entries.lock().unwrap();
        let mut device_model = self.device_model.lock().unwrap();

        *device_model = Some(model);

        // Entries were validated when they were added and the model does not change the bus size.
        let new_bus = self
            .rebuild(&entries, device_model.as_ref())
            .expect("Re-adding validated trap entries cannot fail");
        self.bus.store(Arc::new(new_bus));
    }

    /// Dispatch a trapped read.
    pub fn read(&self, req: Request) -> u64 {
        self.bus.load().read(req)
    }

    /// Dispatch a trapped write.
    pub fn write(&self, req: Request, value: u64) {
        self.bus.load().write(req, value)
    }
}

#[cfg(test)]
mod tests {
    use crate::device::bus::{Forward, IoHandler, RequestSize};

    use super::*;

    #[derive(Debug, Default)]
    struct TestHandler {}

    impl IoHandler for TestHandler {
        fn size(&self) -> u64 {
            0x1000
        }

        fn read(&self, _req: Request) -> Result<u64, Forward> {
            Ok(42)
        }

        fn write(&self, _req: Request, _value: u64) -> Result<(), Forward> {
            Ok(())
        }
    }

    #[test]
    fn can_add_handlers() {
        let table = TrapTable::new("test", u64::MAX);

        assert_eq!(table.read(Request::new(0x1000, RequestSize::Size1)), 0xFF);

        table.add(0x1000, Arc::new(TestHandler::default())).unwrap();
        assert_eq!(table.read(Request::new(0x1000, RequestSize::Size1)), 42);
    }

    #[test]
    fn failed_registration_keeps_the_table() {
        let table = TrapTable::new("test", u64::MAX);

        table.add(0x1000, Arc::new(TestHandler::default())).unwrap();
        assert!(table.add(0x1800, Arc::new(TestHandler::default())).is_err());

        // A later, valid registration must not trip over the rejected entry.
        table.add(0x2000, Arc::new(TestHandler::default())).unwrap();
        assert_eq!(table.read(Request::new(0x2000, RequestSize::Size1)), 42);
    }

    #[test]
    fn removed_handlers_stop_answering() {
        let table = TrapTable::new("test", u64::MAX);

        table.add(0x1000, Arc::new(TestHandler::default())).unwrap();

        assert!(table.remove(0x1000));
        assert!(!table.remove(0x1000));
        assert_eq!(table.read(Request::new(0x1000, RequestSize::Size1)), 0xFF);

        // The range is free again.
        table.add(0x1800, Arc::new(TestHandler::default())).unwrap();
    }

    #[test]
    fn device_model_survives_registration() {
        use crate::device::bus::testutils::RecordingDeviceModel;

        let table = TrapTable::new("test", u64::MAX);
        let model = Arc::new(RecordingDeviceModel::default());

        table.set_device_model(model.clone());
        table.add(0x1000, Arc::new(TestHandler::default())).unwrap();

        table.read(Request::new(0x10, RequestSize::Size4));
        assert_eq!(model.reads.lock().unwrap().len(), 1);
    }
}
