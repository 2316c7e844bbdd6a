//! Peripheral Device Contracts
//!
//! The workstation core talks to its peripherals through four narrow
//! capability traits. Each trait mirrors the operation table of one
//! memory-mapped port:
//!
//! - [`Led`]: the diagnostic LED bank (write-only).
//! - [`Serial`]: the RS-232 port (status/data reads, data writes).
//! - [`Spi`]: one SPI channel, in practice an SD-card style block device.
//! - [`Clipboard`]: the host clipboard bridge (control + data registers).
//!
//! All peripherals are optional. An absent device reads as a defined
//! default (0 for most ports, 255 for SPI data) and swallows writes, so the
//! guest can always probe the full register file safely.
//!
//! Device callbacks run synchronously from inside the execution loop and
//! must not block.

/// Value returned when reading SPI data with no device on the selected
/// channel (an SD card holds the line high while idle).
pub const SPI_ABSENT_DATA: u32 = 255;

/// Diagnostic LED bank.
pub trait Led {
    /// Latches a new LED state. Only the low bits are meaningful to the
    /// guest; the full word is passed through.
    fn write(&mut self, value: u32);
}

/// RS-232 serial port.
pub trait Serial {
    /// Reads the status register (bit 0: receive ready, bit 1: transmit
    /// ready).
    fn read_status(&mut self) -> u32;
    /// Reads one received byte (in the low 8 bits).
    fn read_data(&mut self) -> u32;
    /// Transmits one byte (taken from the low 8 bits).
    fn write_data(&mut self, value: u32);
}

/// One SPI channel.
pub trait Spi {
    /// Reads the last byte shifted in from the device.
    fn read_data(&mut self) -> u32;
    /// Shifts one byte out to the device.
    fn write_data(&mut self, value: u32);
}

/// Host clipboard bridge.
pub trait Clipboard {
    /// Reads the control register (typically the pending paste length).
    fn read_control(&mut self) -> u32;
    /// Writes the control register (typically starts a copy of N bytes).
    fn write_control(&mut self, value: u32);
    /// Reads the next byte of a paste in progress.
    fn read_data(&mut self) -> u32;
    /// Appends one byte to a copy in progress.
    fn write_data(&mut self, value: u32);
}

/// The set of installed peripherals.
///
/// Owned by the I/O port file; every slot starts empty. The accessors fold
/// the absent-device defaults in, so callers never need to distinguish
/// "no device" from "device returned the default".
pub struct Peripherals {
    led: Option<Box<dyn Led>>,
    serial: Option<Box<dyn Serial>>,
    spi: [Option<Box<dyn Spi>>; 4],
    clipboard: Option<Box<dyn Clipboard>>,
}

impl Default for Peripherals {
    fn default() -> Self {
        Self::new()
    }
}

impl Peripherals {
    /// Creates an empty peripheral set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            led: None,
            serial: None,
            spi: [None, None, None, None],
            clipboard: None,
        }
    }

    /// Installs the LED device.
    pub fn set_led(&mut self, led: Box<dyn Led>) {
        self.led = Some(led);
    }

    /// Installs the serial device.
    pub fn set_serial(&mut self, serial: Box<dyn Serial>) {
        self.serial = Some(serial);
    }

    /// Installs an SPI device at the given channel.
    ///
    /// Only channels 1 (SD card) and 2 (network) exist on the board; other
    /// indices are ignored.
    pub fn set_spi(&mut self, index: usize, spi: Box<dyn Spi>) {
        if index == 1 || index == 2 {
            self.spi[index] = Some(spi);
        }
    }

    /// Installs the clipboard device.
    pub fn set_clipboard(&mut self, clipboard: Box<dyn Clipboard>) {
        self.clipboard = Some(clipboard);
    }

    pub(crate) fn led_write(&mut self, value: u32) {
        if let Some(led) = &mut self.led {
            led.write(value);
        }
    }

    pub(crate) fn serial_status(&mut self) -> u32 {
        self.serial.as_mut().map_or(0, |s| s.read_status())
    }

    pub(crate) fn serial_read(&mut self) -> u32 {
        self.serial.as_mut().map_or(0, |s| s.read_data())
    }

    pub(crate) fn serial_write(&mut self, value: u32) {
        if let Some(serial) = &mut self.serial {
            serial.write_data(value);
        }
    }

    pub(crate) fn spi_read(&mut self, channel: usize) -> u32 {
        self.spi[channel]
            .as_mut()
            .map_or(SPI_ABSENT_DATA, |s| s.read_data())
    }

    pub(crate) fn spi_write(&mut self, channel: usize, value: u32) {
        if let Some(spi) = &mut self.spi[channel] {
            spi.write_data(value);
        }
    }

    pub(crate) fn clipboard_read_control(&mut self) -> u32 {
        self.clipboard.as_mut().map_or(0, |c| c.read_control())
    }

    pub(crate) fn clipboard_write_control(&mut self, value: u32) {
        if let Some(clipboard) = &mut self.clipboard {
            clipboard.write_control(value);
        }
    }

    pub(crate) fn clipboard_read_data(&mut self) -> u32 {
        self.clipboard.as_mut().map_or(0, |c| c.read_data())
    }

    pub(crate) fn clipboard_write_data(&mut self, value: u32) {
        if let Some(clipboard) = &mut self.clipboard {
            clipboard.write_data(value);
        }
    }
}
