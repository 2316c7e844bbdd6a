//! # oberon32
//!
//! An emulator for a RISC-V (RV32IM) workstation that boots an Oberon-style
//! operating system from an embedded boot ROM.
//!
//! The machine is a CPU over a unified 32-bit address space: RAM with a
//! monochrome framebuffer near its top, a 512-word boot ROM at the top of
//! the address space, and a memory-mapped I/O window modeling a millisecond
//! timer, switches, LEDs, an RS-232 port, four SPI channels, a keyboard
//! queue, a mouse register and a clipboard bridge. Peripherals plug in
//! through the narrow traits in [`devices`]; absent devices have defined
//! defaults.
//!
//! The host drives the machine cooperatively, slice by slice:
//!
//! ```
//! use oberon32::{Machine, SliceExit};
//!
//! let mut machine = Machine::new();
//! machine.set_time(0);
//! match machine.execute(8192) {
//!     SliceExit::Budget => { /* repaint from machine.take_damage() */ }
//!     SliceExit::Debug => { /* attach a debugger */ }
//!     SliceExit::Halted => { /* guest parked the CPU */ }
//! }
//! ```
//!
//! There is no internal threading: one machine belongs to one driver
//! thread, and the framebuffer may only be read between `execute` calls.

pub mod bus;
pub mod damage;
pub mod decode;
pub mod devices;
mod instructions;
pub mod io;
pub mod machine;
pub mod registers;
mod rom;
pub mod trace;

pub use bus::{IO_START, ROM_START, ROM_WORDS};
pub use damage::Damage;
pub use devices::{Clipboard, Led, Serial, Spi};
pub use machine::{ConfigError, Machine, MachineConfig, SliceExit, PROGRESS_BUDGET};
