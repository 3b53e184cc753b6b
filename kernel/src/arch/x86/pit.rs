//! 8254 programmable interval timer.

use super::port::outb;

/// Base oscillator frequency of the 8254, in Hz.
const PIT_OSC_HZ: u32 = 1_193_182;

const CHANNEL0_DATA: u16 = 0x40;
const MODE_CMD: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator), binary.
const CH0_RATE_GENERATOR: u8 = 0x34;

/// Program channel 0 to raise IRQ 0 at `hz`.
///
/// # Safety
///
/// Must run with interrupts disabled; reprogramming the timer mid-tick
/// would otherwise race its own interrupt.
pub unsafe fn set_frequency(hz: u32) {
    assert!(hz > 0 && hz <= PIT_OSC_HZ, "timer frequency out of range");
    let divisor = PIT_OSC_HZ / hz;
    assert!(divisor <= u16::MAX as u32, "timer frequency too low");

    // SAFETY: documented 8254 programming sequence, channel 0.
    unsafe {
        outb(MODE_CMD, CH0_RATE_GENERATOR);
        outb(CHANNEL0_DATA, (divisor & 0xff) as u8);
        outb(CHANNEL0_DATA, (divisor >> 8) as u8);
    }
}
