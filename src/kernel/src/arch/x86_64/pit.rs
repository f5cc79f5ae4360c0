//! The 8253/8254 programmable interval timer.
//!
//! Channel 0 drives the scheduler tick when the legacy PIC is in use.
//! Channel 2, whose output can be polled through port 0x61, serves as a
//! reference clock for calibrating the local APIC timer.

use crate::interrupts::controller::{pit_divisor, PIT_FREQUENCY};
use kestrel_common::IrqError;
use x86_64::instructions::port::Port;

const CHANNEL0: u16 = 0x40;
const CHANNEL2: u16 = 0x42;
const COMMAND: u16 = 0x43;
const GATE: u16 = 0x61;

/// Channel 0, lobyte/hibyte, mode 2 (rate generator).
const CHANNEL0_RATE: u8 = 0x34;
/// Channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count).
const CHANNEL2_ONESHOT: u8 = 0xB0;

/// Programs channel 0 to fire IRQ 0 `hz` times per second.
pub fn start_periodic(hz: u32) -> Result<(), IrqError> {
    let divisor = pit_divisor(hz)?;
    let mut command: Port<u8> = Port::new(COMMAND);
    let mut data: Port<u8> = Port::new(CHANNEL0);
    // SAFETY: the PIT ports are owned by this module.
    unsafe {
        command.write(CHANNEL0_RATE);
        data.write(divisor as u8);
        data.write((divisor >> 8) as u8);
    }
    log::info!("PIT channel 0 at {} Hz (divisor {})", hz, divisor);
    Ok(())
}

/// Busy-waits for `ms` milliseconds (at most 54) on channel 2.
pub fn wait_ms(ms: u32) {
    let count = (PIT_FREQUENCY / 1000 * ms.clamp(1, 54)) as u16;
    let mut gate: Port<u8> = Port::new(GATE);
    let mut command: Port<u8> = Port::new(COMMAND);
    let mut data: Port<u8> = Port::new(CHANNEL2);
    // SAFETY: channel 2 and the speaker gate are only used here. The speaker
    // output bit is kept clear.
    unsafe {
        let speaker = gate.read() & !0b11;
        gate.write(speaker);
        command.write(CHANNEL2_ONESHOT);
        data.write(count as u8);
        data.write((count >> 8) as u8);
        gate.write(speaker | 1);
        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
        gate.write(speaker);
    }
}
