//! Platform ports supplied by the integrator.
//!
//! The library performs no hardware access of its own; the traits below are
//! the seam to the target's HAL/BSP. Methods with default bodies are the
//! optional hooks: single-context integrations can keep the lock-free
//! resource defaults, and targets with a hardware CRC unit override
//! [`McbIo::check_crc`] and construct the instance with software CRC
//! disabled.

use crate::frame;

/// Object-level port: SPI transport, IRQ line and bus resource of one slave.
pub trait McbIo {
    /// Synchronous full-duplex exchange of `tx.len()` 16-bit words.
    /// Chip-select handling lives here.
    fn spi_transfer(&mut self, tx: &[u16], rx: &mut [u16]);

    /// Level of the slave IRQ line. High means the slave is up and ready to
    /// exchange a frame.
    fn irq_is_high(&self) -> bool;

    /// Whether the SPI peripheral can accept a new transfer.
    fn is_ready(&self) -> bool;

    /// Pulses the Sync0/Sync1 timing reference. The slave triggers on the
    /// rising edge; minimum pulse width 20 ns.
    fn sync_pulse(&mut self) {}

    fn init_resource(&mut self) {}

    fn deinit_resource(&mut self) {}

    /// Non-blocking claim of the per-instance bus resource.
    fn try_take_resource(&mut self) -> bool {
        true
    }

    /// Blocking claim of the per-instance bus resource.
    fn take_resource(&mut self) -> bool {
        true
    }

    fn release_resource(&mut self) {}

    /// Validates a received frame, CRC word included. The default is the
    /// bundled software XMODEM residue check.
    fn check_crc(&mut self, words: &[u16]) -> bool {
        frame::crc(words) == 0
    }
}

/// Static port for time and cooperative scheduling.
pub trait TimeOps {
    /// Milliseconds since an arbitrary epoch; may wrap.
    fn now_ms() -> u32;

    /// Gives up the CPU inside busy-wait loops. Should be a no-op outside
    /// RTOS targets.
    fn yield_cpu();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Cmd, Frame};

    struct NullIo;

    impl McbIo for NullIo {
        fn spi_transfer(&mut self, _tx: &[u16], _rx: &mut [u16]) {}
        fn irq_is_high(&self) -> bool {
            true
        }
        fn is_ready(&self) -> bool {
            true
        }
    }

    #[test]
    fn default_crc_check() {
        let mut io = NullIo;
        let mut frm = Frame::new();
        frm.build_config(0x123, Cmd::Ack, false, &[5, 6, 7, 8], true);
        assert!(io.check_crc(frm.words()));

        let mut bad = [0u16; 6];
        bad.copy_from_slice(frm.words());
        bad[2] ^= 0x0100;
        assert!(!io.check_crc(&bad));
    }
}
