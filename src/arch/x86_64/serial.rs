//! x86_64 serial driver
//!
//! 16550-compatible UART on COM1, polled over raw port I/O. Early boot
//! output and kernel logging both funnel through here, so the driver stays
//! interrupt-free: the IER is parked at zero and every send spins on the
//! line-status register instead.

use super::cpu::{inb, outb};

/// A 16550 addressed by its base I/O port.
struct Uart16550 {
    base: u16,
}

// Register offsets from the base port. DATA and INT_ENABLE double as the
// divisor-latch pair while LCR_DLAB is set.
const DATA: u16 = 0;
const INT_ENABLE: u16 = 1;
const FIFO_CTRL: u16 = 2;
const LINE_CTRL: u16 = 3;
const MODEM_CTRL: u16 = 4;
const LINE_STATUS: u16 = 5;

// Line-control bits
const LCR_8N1: u8 = 0x03;
const LCR_DLAB: u8 = 0x80;

// Line-status bits
const LSR_RX_READY: u8 = 1 << 0;
const LSR_TX_EMPTY: u8 = 1 << 5;

// FIFO control: enable, flush both queues, 14-byte receive threshold
const FCR_SETUP: u8 = 0xC7;

// Modem control: DTR + RTS + OUT2
const MCR_SETUP: u8 = 0x0B;

/// Divisor against the UART's 115200-baud reference; 1 keeps full rate
const BAUD_DIVISOR: u16 = 1;

const COM1: Uart16550 = Uart16550 { base: 0x3F8 };

impl Uart16550 {
    #[inline]
    unsafe fn reg_write(&self, offset: u16, val: u8) {
        unsafe { outb(self.base + offset, val) }
    }

    #[inline]
    unsafe fn reg_read(&self, offset: u16) -> u8 {
        unsafe { inb(self.base + offset) }
    }

    fn setup(&self) {
        unsafe {
            // Polled operation: no UART interrupts
            self.reg_write(INT_ENABLE, 0x00);
            // Program the baud divisor behind the latch, then drop back to
            // 8 data bits, no parity, one stop bit
            self.reg_write(LINE_CTRL, LCR_DLAB);
            self.reg_write(DATA, (BAUD_DIVISOR & 0xFF) as u8);
            self.reg_write(INT_ENABLE, (BAUD_DIVISOR >> 8) as u8);
            self.reg_write(LINE_CTRL, LCR_8N1);
            self.reg_write(FIFO_CTRL, FCR_SETUP);
            self.reg_write(MODEM_CTRL, MCR_SETUP);
        }
    }

    /// Spin until the transmit holding register drains, then send.
    fn send(&self, byte: u8) {
        unsafe {
            while self.reg_read(LINE_STATUS) & LSR_TX_EMPTY == 0 {
                core::hint::spin_loop();
            }
            self.reg_write(DATA, byte);
        }
    }

    fn recv(&self) -> Option<u8> {
        unsafe {
            if self.reg_read(LINE_STATUS) & LSR_RX_READY != 0 {
                Some(self.reg_read(DATA))
            } else {
                None
            }
        }
    }
}

/// Initialize COM1
pub fn init() {
    COM1.setup();
}

/// Write a single byte to serial
pub fn write_byte(byte: u8) {
    COM1.send(byte);
}

/// Write a byte slice to serial, expanding newlines to CRLF for terminals
pub fn write_bytes(bytes: &[u8]) {
    for &b in bytes {
        if b == b'\n' {
            COM1.send(b'\r');
        }
        COM1.send(b);
    }
}

/// Try to read a byte from serial (non-blocking)
pub fn read_byte() -> Option<u8> {
    COM1.recv()
}
