//! Serial output
//!
//! Locked, formatted printing over COM1, plus raw unlocked writes for fault
//! handlers that must not allocate or re-enter the formatter.

use core::fmt;
use spin::Mutex;

/// Global serial lock (prevents interleaved output from multiple cores)
static SERIAL_LOCK: Mutex<()> = Mutex::new(());

/// Initialize the serial port
pub fn init() {
    crate::arch::serial::init();
}

/// Serial writer (implements core::fmt::Write)
struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::arch::serial::write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Print to serial port (internal use)
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // Disable interrupts to prevent deadlock against interrupt-context prints
    crate::arch::without_interrupts(|| {
        let _lock = SERIAL_LOCK.lock();
        let mut writer = SerialWriter;
        let _ = writer.write_fmt(args);
    });
}

/// Print to serial port
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print to serial port with newline
#[macro_export]
macro_rules! serial_println {
    () => { $crate::serial_print!("\n") };
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

// ============================================================================
// Raw writes — fault-path safe
// ============================================================================
//
// Fault handlers (#DF, #GP, #UD) cannot rely on the formatter or the lock:
// the fault may have been raised from inside either. These bypass both.

/// Write a string without locking or formatting
pub fn write_str_raw(s: &str) {
    crate::arch::serial::write_bytes(s.as_bytes());
}

/// Write a value as 16 hex digits without locking or formatting
pub fn write_hex_raw(val: u64) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    crate::arch::serial::write_bytes(b"0x");
    for i in (0..16).rev() {
        let nibble = ((val >> (i * 4)) & 0xF) as usize;
        crate::arch::serial::write_byte(DIGITS[nibble]);
    }
}

/// Write a newline without locking
pub fn write_newline_raw() {
    crate::arch::serial::write_bytes(b"\n");
}
