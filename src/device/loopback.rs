//! Loopback link driver (component F).
//!
//! Bounded in-memory FIFO feeding straight back into the input path.
//! Grounded on `examples/original_source/driver/loopback.c`.

use super::DeviceOps;
use crate::error::DeviceError;
use crate::interrupt::Interrupts;
use crate::queue::Fifo;
use std::sync::{Arc, Mutex};

const QUEUE_LIMIT: usize = 16;

struct Entry {
    ethertype: u16,
    data: Vec<u8>,
}

pub struct LoopbackDriver {
    irq: u32,
    interrupts: Arc<Interrupts>,
    queue: Mutex<Fifo<Entry>>,
}

impl LoopbackDriver {
    pub fn new(irq: u32, interrupts: Arc<Interrupts>) -> Arc<Self> {
        Arc::new(LoopbackDriver { irq, interrupts, queue: Mutex::new(Fifo::new()) })
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Drains the queue, handing each frame to `sink`. Called by the IRQ
    /// handler `net.rs` registers for this driver's IRQ.
    pub fn drain(&self, mut sink: impl FnMut(u16, &[u8])) {
        loop {
            let entry = {
                let mut queue = self.queue.lock().expect("loopback queue poisoned");
                match queue.pop() {
                    Some(entry) => entry,
                    None => break,
                }
            };
            sink(entry.ethertype, &entry.data);
        }
    }
}

impl DeviceOps for LoopbackDriver {
    fn transmit(&self, ethertype: u16, data: &[u8], _dst: &[u8]) -> Result<(), DeviceError> {
        {
            let mut queue = self.queue.lock().expect("loopback queue poisoned");
            if queue.num() >= QUEUE_LIMIT {
                return Err(DeviceError::Transmit("loopback queue is full".into()));
            }
            queue.push(Entry { ethertype, data: data.to_vec() });
        }
        self.interrupts.raise_irq(self.irq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmit_then_drain_preserves_order_and_type() {
        let interrupts = Interrupts::new();
        let driver = LoopbackDriver::new(99, interrupts.clone());
        driver.transmit(0x0800, &[1, 2, 3], &[]).unwrap();
        driver.transmit(0x0806, &[4, 5], &[]).unwrap();

        let mut seen = Vec::new();
        driver.drain(|ethertype, data| seen.push((ethertype, data.to_vec())));
        assert_eq!(seen, vec![(0x0800, vec![1, 2, 3]), (0x0806, vec![4, 5])]);
        interrupts.shutdown();
    }

    #[test]
    fn transmit_fails_once_queue_limit_reached() {
        let interrupts = Interrupts::new();
        let driver = LoopbackDriver::new(99, interrupts.clone());
        for _ in 0..QUEUE_LIMIT {
            driver.transmit(0x0800, &[0], &[]).unwrap();
        }
        assert!(driver.transmit(0x0800, &[0], &[]).is_err());
        interrupts.shutdown();
    }
}
