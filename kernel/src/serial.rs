//! Serial console (COM1, 16550-compatible).
//!
//! The kernel's only output device: the boot banner, `log` records and
//! fatal reports all end up here. On the host build the same entry point
//! forwards to stderr so that test diagnostics still show up.

use core::fmt;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod uart {
    use core::fmt;

    use crate::arch::x86::port::{inb, outb};

    const COM1: u16 = 0x3f8;

    const DATA: u16 = COM1;
    const INT_ENABLE: u16 = COM1 + 1;
    const FIFO_CTRL: u16 = COM1 + 2;
    const LINE_CTRL: u16 = COM1 + 3;
    const MODEM_CTRL: u16 = COM1 + 4;
    const LINE_STATUS: u16 = COM1 + 5;

    const LSR_THR_EMPTY: u8 = 1 << 5;

    pub struct SerialPort {
        initialized: bool,
    }

    impl SerialPort {
        pub const fn new() -> Self {
            Self { initialized: false }
        }

        /// 115200 baud, 8N1, FIFOs on.
        pub fn init(&mut self) {
            // SAFETY: documented 16550 initialization sequence on COM1.
            unsafe {
                outb(INT_ENABLE, 0x00); // no UART interrupts, we poll
                outb(LINE_CTRL, 0x80); // DLAB on
                outb(DATA, 0x01); // divisor 1 = 115200 baud
                outb(INT_ENABLE, 0x00);
                outb(LINE_CTRL, 0x03); // 8 bits, no parity, 1 stop, DLAB off
                outb(FIFO_CTRL, 0xc7); // FIFOs on, cleared, 14-byte threshold
                outb(MODEM_CTRL, 0x0b); // DTR + RTS + OUT2
            }
            self.initialized = true;
        }

        fn write_byte(&mut self, byte: u8) {
            if !self.initialized {
                self.init();
            }
            // SAFETY: polling the line-status register then writing the
            // transmit register is the documented way to send a byte.
            unsafe {
                while inb(LINE_STATUS) & LSR_THR_EMPTY == 0 {
                    core::hint::spin_loop();
                }
                outb(DATA, byte);
            }
        }
    }

    impl fmt::Write for SerialPort {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                if byte == b'\n' {
                    self.write_byte(b'\r');
                }
                self.write_byte(byte);
            }
            Ok(())
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
static SERIAL: spin::Mutex<uart::SerialPort> = spin::Mutex::new(uart::SerialPort::new());

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        use core::fmt::Write;
        // Writing from an interrupt handler while a thread holds the port
        // would deadlock the spinlock; keep interrupts off for the write.
        crate::sync::irqlock::without_interrupts(|| {
            let _ = SERIAL.lock().write_fmt(args);
        });
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        use std::io::Write;
        let _ = std::io::stderr().write_fmt(args);
    }
}
