//! Dummy link driver (component F): discards every frame, raising its IRQ
//! purely so tests can observe IRQ delivery. Grounded on
//! `examples/original_source/driver/dummy.c`.

use super::DeviceOps;
use crate::error::DeviceError;
use crate::interrupt::Interrupts;
use std::sync::Arc;

pub struct DummyDriver {
    irq: u32,
    interrupts: Arc<Interrupts>,
}

impl DummyDriver {
    pub fn new(irq: u32, interrupts: Arc<Interrupts>) -> Arc<Self> {
        Arc::new(DummyDriver { irq, interrupts })
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }
}

impl DeviceOps for DummyDriver {
    fn transmit(&self, ethertype: u16, data: &[u8], _dst: &[u8]) -> Result<(), DeviceError> {
        log::debug!("dummy: discarding {} byte frame, type=0x{ethertype:04x}", data.len());
        self.interrupts.raise_irq(self.irq);
        Ok(())
    }
}
