//! Memory-Mapped I/O Register File
//!
//! The top of the address space aliases the peripheral registers. All
//! accesses are word-sized and word-aligned; offsets are relative to the
//! I/O window base (see [`crate::bus::IO_START`]).
//!
//! ## Register Map
//!
//! | Offset | Read                          | Write                   |
//! |--------|-------------------------------|-------------------------|
//! | 0      | millisecond counter           | -                       |
//! | 4      | switches                      | LED bank                |
//! | 8      | RS-232 data                   | RS-232 data             |
//! | 12     | RS-232 status                 | -                       |
//! | 16     | SPI data (selected channel)   | SPI data                |
//! | 20     | SPI status (rx always ready)  | SPI channel select      |
//! | 24     | mouse word + keyboard status  | -                       |
//! | 28     | next keyboard scancode        | -                       |
//! | 32     | -                             | call-trace port         |
//! | 40     | clipboard control             | clipboard control       |
//! | 44     | clipboard data                | clipboard data          |
//!
//! Reads of the millisecond counter, and of the mouse word while the
//! keyboard queue is empty, spend one unit of the per-slice progress
//! budget. That damping is what bounces a guest busy-polling for input
//! back to the host promptly instead of burning its whole cycle allowance.

use crate::devices::Peripherals;
use crate::trace::CallTrace;
use log::warn;

/// Register offsets within the I/O window.
pub mod ports {
    /// Millisecond counter (read).
    pub const MILLISECONDS: u32 = 0;
    /// Switches (read) / LED bank (write).
    pub const SWITCHES_LED: u32 = 4;
    /// RS-232 data.
    pub const SERIAL_DATA: u32 = 8;
    /// RS-232 status (read-only).
    pub const SERIAL_STATUS: u32 = 12;
    /// SPI data on the selected channel.
    pub const SPI_DATA: u32 = 16;
    /// SPI status (read) / control (write).
    pub const SPI_CONTROL: u32 = 20;
    /// Mouse word with keyboard-ready bit (read-only).
    pub const MOUSE: u32 = 24;
    /// Keyboard scancode pop (read-only).
    pub const KEYBOARD: u32 = 28;
    /// Call-trace sidechannel (write-only).
    pub const TRACE: u32 = 32;
    /// Clipboard control.
    pub const CLIPBOARD_CONTROL: u32 = 40;
    /// Clipboard data.
    pub const CLIPBOARD_DATA: u32 = 44;
}

/// Bit set in the mouse word when the keyboard queue is non-empty.
const MOUSE_KEYBOARD_READY: u32 = 1 << 28;

/// Keyboard FIFO capacity in scancode bytes.
const KEY_BUFFER_SIZE: usize = 16;

/// The I/O port state: installed peripherals plus the board-level input
/// latches the host pushes between slices.
pub struct Io {
    pub(crate) devices: Peripherals,
    pub(crate) trace: CallTrace,
    /// Soft per-slice budget; I/O polls with no work available decrement it.
    pub(crate) progress: u32,
    key_buf: [u8; KEY_BUFFER_SIZE],
    key_cnt: usize,
    mouse: u32,
    switches: u32,
    current_tick: u32,
    spi_selected: usize,
}

impl Default for Io {
    fn default() -> Self {
        Self::new()
    }
}

impl Io {
    /// Creates the port file with no peripherals and all latches zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: Peripherals::new(),
            trace: CallTrace::new(),
            progress: 0,
            key_buf: [0; KEY_BUFFER_SIZE],
            key_cnt: 0,
            mouse: 0,
            switches: 0,
            current_tick: 0,
            spi_selected: 0,
        }
    }

    /// Handles a word read at `offset` from the window base.
    pub fn read(&mut self, offset: u32) -> u32 {
        match offset {
            ports::MILLISECONDS => {
                self.progress = self.progress.saturating_sub(1);
                self.current_tick
            }
            ports::SWITCHES_LED => self.switches,
            ports::SERIAL_DATA => self.devices.serial_read(),
            ports::SERIAL_STATUS => self.devices.serial_status(),
            ports::SPI_DATA => self.devices.spi_read(self.spi_selected),
            // Bit 0: rx ready. The emulated shift register is always done.
            ports::SPI_CONTROL => 1,
            ports::MOUSE => {
                if self.key_cnt > 0 {
                    self.mouse | MOUSE_KEYBOARD_READY
                } else {
                    self.progress = self.progress.saturating_sub(1);
                    self.mouse
                }
            }
            ports::KEYBOARD => self.pop_scancode(),
            ports::CLIPBOARD_CONTROL => self.devices.clipboard_read_control(),
            ports::CLIPBOARD_DATA => self.devices.clipboard_read_data(),
            _ => 0,
        }
    }

    /// Handles a word write at `offset` from the window base.
    pub fn write(&mut self, offset: u32, value: u32) {
        match offset {
            ports::SWITCHES_LED => self.devices.led_write(value),
            ports::SERIAL_DATA => self.devices.serial_write(value),
            ports::SPI_DATA => self.devices.spi_write(self.spi_selected, value),
            // Bits 0-1: slave select. Bit 2 (fast mode) and bit 3 (network
            // enable) are accepted and ignored.
            ports::SPI_CONTROL => self.spi_selected = (value & 3) as usize,
            ports::TRACE => self.trace.write(value),
            ports::CLIPBOARD_CONTROL => self.devices.clipboard_write_control(value),
            ports::CLIPBOARD_DATA => self.devices.clipboard_write_data(value),
            _ => warn!("wrote {value:#010x} to undefined io offset {offset}"),
        }
    }

    fn pop_scancode(&mut self) -> u32 {
        if self.key_cnt == 0 {
            return 0;
        }
        let scancode = self.key_buf[0];
        self.key_cnt -= 1;
        self.key_buf.copy_within(1.., 0);
        u32::from(scancode)
    }

    /// Queues scancode bytes for the guest. The whole batch is dropped if
    /// it would overflow the FIFO.
    pub fn keyboard_input(&mut self, scancodes: &[u8]) {
        if KEY_BUFFER_SIZE - self.key_cnt >= scancodes.len() {
            self.key_buf[self.key_cnt..self.key_cnt + scancodes.len()].copy_from_slice(scancodes);
            self.key_cnt += scancodes.len();
        }
    }

    /// Latches a new mouse position. Coordinates outside 0..4096 leave the
    /// corresponding axis unchanged.
    pub fn mouse_moved(&mut self, x: i32, y: i32) {
        if (0..4096).contains(&x) {
            self.mouse = (self.mouse & !0x0000_0FFF) | x as u32;
        }
        if (0..4096).contains(&y) {
            self.mouse = (self.mouse & !0x00FF_F000) | ((y as u32) << 12);
        }
    }

    /// Latches a mouse button state. Buttons are numbered 1 (left) to
    /// 3 (right); others are ignored.
    pub fn mouse_button(&mut self, button: u32, down: bool) {
        if (1..4).contains(&button) {
            let bit = 1 << (27 - button);
            if down {
                self.mouse |= bit;
            } else {
                self.mouse &= !bit;
            }
        }
    }

    /// Latches the switch bank.
    pub fn set_switches(&mut self, switches: u32) {
        self.switches = switches;
    }

    /// Installs the current millisecond count for the next slice. Expected
    /// to be non-decreasing over the life of the machine.
    pub fn set_time(&mut self, tick: u32) {
        self.current_tick = tick;
    }

    /// Drops any queued scancodes (used at machine reset).
    pub fn clear_keyboard(&mut self) {
        self.key_cnt = 0;
    }
}
