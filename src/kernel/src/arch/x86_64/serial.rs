//! Serial port driver for x86_64.
//!
//! Provides serial output via COM1 (0x3F8) for debugging and logging.

use core::fmt::{self, Write};
use spin::Mutex;
use uart_16550::SerialPort;

/// COM1 I/O port address.
const COM1_PORT: u16 = 0x3F8;

/// Global serial port instance, lazily initialized.
///
/// Uses a spinlock for safe concurrent access from multiple contexts,
/// including interrupt handlers.
pub static SERIAL: spin::Once<Mutex<SerialPort>> = spin::Once::new();

/// Initializes the global serial port.
///
/// This function is idempotent - calling it multiple times has no effect
/// after the first successful initialization.
pub fn init() {
    port();
}

fn port() -> &'static Mutex<SerialPort> {
    SERIAL.call_once(|| {
        // SAFETY: COM1_PORT (0x3F8) is a well-known x86 serial port address.
        // We're running in kernel mode with full I/O port access.
        let mut serial = unsafe { SerialPort::new(COM1_PORT) };
        serial.init();
        Mutex::new(serial)
    })
}

/// Releases the port lock on the way to a halt.
///
/// A fatal trap may have interrupted code in the middle of a write; the
/// processor never returns to it, so its lock would otherwise never be freed.
pub fn unlock_for_panic() {
    if let Some(serial) = SERIAL.get() {
        if serial.is_locked() {
            // SAFETY: only called right before halting for good with
            // interrupts disabled; the interrupted holder never resumes.
            unsafe { serial.force_unlock() };
        }
    }
}

/// Prints to the serial port without a newline.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::arch::x86_64::serial::_print(format_args!($($arg)*))
    };
}

/// Prints to the serial port with a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)))
}

/// Internal print function used by macros.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        // A failed write to COM1 has nowhere to be reported.
        let _ = port().lock().write_fmt(args);
    });
}

/// COM1 as a [`kestrel_hal::Serial`].
pub struct Com1;

impl kestrel_hal::Serial for Com1 {
    fn write_byte(&mut self, byte: u8) {
        x86_64::instructions::interrupts::without_interrupts(|| port().lock().send(byte));
    }

    fn read_byte(&mut self) -> Option<u8> {
        x86_64::instructions::interrupts::without_interrupts(|| port().lock().try_receive().ok())
    }
}
