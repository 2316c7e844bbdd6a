//! Machine Lifecycle and Slice Loop
//!
//! A [`Machine`] owns the complete workstation state: CPU registers, CSRs,
//! RAM with its framebuffer tail, the boot ROM, the I/O port file and the
//! installed peripherals. The host drives it cooperatively:
//!
//! 1. push input state (`set_time`, `mouse_moved`, `keyboard_input`, ...),
//! 2. call [`Machine::execute`] with a cycle budget,
//! 3. pull [`Machine::take_damage`] and repaint from
//!    [`Machine::framebuffer`],
//! 4. repeat, until the machine reports [`SliceExit::Halted`].
//!
//! A slice ends when the cycle budget is spent, when the soft `progress`
//! budget is exhausted by fruitless I/O polling, or when a debug or halt
//! condition fires. The machine is single threaded; the host must only
//! touch the framebuffer between `execute` calls.

use crate::bus::{Bus, ROM_START};
use crate::damage::Damage;
use crate::decode::Instruction;
use crate::devices::{Clipboard, Led, Serial, Spi};
use crate::instructions::Step;
use crate::registers::{CsrFile, RegisterFile};
use crate::rom;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Soft per-slice budget: the number of fruitless I/O polls (timer reads,
/// keyboard-status reads with an empty queue) a slice tolerates before
/// handing control back to the host.
pub const PROGRESS_BUDGET: u32 = 20;

/// `jal x0, 0`: an unconditional jump to itself. The guest parks the CPU
/// with it, so the machine treats it as the halt signal.
const HALT_WORD: u32 = 0x0000_006F;

/// Machine geometry. `Default` matches the stock board: 1 MiB of RAM with
/// a 1024x768 monochrome framebuffer near the top.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// RAM size in bytes.
    pub mem_size: u32,
    /// Byte address where the framebuffer begins; everything from here to
    /// the end of RAM is display memory.
    pub display_start: u32,
    /// Framebuffer width in pixels (1 bpp, so a multiple of 32).
    pub fb_width: u32,
    /// Framebuffer height in lines.
    pub fb_height: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            mem_size: 0x0010_0000,
            display_start: 0x000E_7F00,
            fb_width: 1024,
            fb_height: 768,
        }
    }
}

impl MachineConfig {
    /// Framebuffer width in words.
    #[must_use]
    pub const fn fb_width_words(&self) -> u32 {
        self.fb_width / 32
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mem_size == 0 || self.mem_size % 4 != 0 {
            return Err(ConfigError::UnalignedMemSize(self.mem_size));
        }
        if self.display_start % 4 != 0 {
            return Err(ConfigError::UnalignedDisplayStart(self.display_start));
        }
        if self.display_start >= self.mem_size {
            return Err(ConfigError::DisplayPastRam {
                display_start: self.display_start,
                mem_size: self.mem_size,
            });
        }
        if self.fb_width == 0 || self.fb_width % 32 != 0 || self.fb_height == 0 {
            return Err(ConfigError::BadGeometry {
                width: self.fb_width,
                height: self.fb_height,
            });
        }
        let fb_bytes = self.fb_width_words() * self.fb_height * 4;
        if self.display_start + fb_bytes > self.mem_size {
            return Err(ConfigError::FramebufferPastRam {
                required: fb_bytes,
                available: self.mem_size - self.display_start,
            });
        }
        Ok(())
    }
}

/// Errors rejected by [`Machine::with_config`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// RAM size is zero or not word aligned.
    UnalignedMemSize(u32),
    /// Display start is not word aligned.
    UnalignedDisplayStart(u32),
    /// Display start lies at or past the end of RAM.
    DisplayPastRam { display_start: u32, mem_size: u32 },
    /// Width is not a positive multiple of 32 pixels, or height is zero.
    BadGeometry { width: u32, height: u32 },
    /// The visible screen does not fit between display start and RAM end.
    FramebufferPastRam { required: u32, available: u32 },
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnalignedMemSize(size) => {
                write!(f, "RAM size {size:#x} is not a positive word multiple")
            }
            Self::UnalignedDisplayStart(addr) => {
                write!(f, "display start {addr:#x} is not word aligned")
            }
            Self::DisplayPastRam {
                display_start,
                mem_size,
            } => write!(
                f,
                "display start {display_start:#x} is past the end of RAM ({mem_size:#x})"
            ),
            Self::BadGeometry { width, height } => write!(
                f,
                "framebuffer geometry {width}x{height} is not a positive multiple of 32 pixels wide"
            ),
            Self::FramebufferPastRam {
                required,
                available,
            } => write!(
                f,
                "framebuffer needs {required:#x} bytes but only {available:#x} fit below RAM end"
            ),
        }
    }
}

/// Why [`Machine::execute`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceExit {
    /// The cycle or progress budget ran out; call `execute` again.
    Budget,
    /// EBREAK, ECALL or a watched store fired; the host may attach a
    /// debugger before resuming.
    Debug,
    /// The guest parked the CPU (`jal x0, 0`) or fetched from unmapped
    /// space. The machine is finished.
    Halted,
}

impl SliceExit {
    /// True when the host should take a debugger turn.
    #[must_use]
    pub const fn needs_debug(self) -> bool {
        matches!(self, Self::Debug)
    }
}

/// The emulated workstation.
pub struct Machine {
    pub(crate) regs: RegisterFile,
    pub(crate) csr: CsrFile,
    pub(crate) bus: Bus,
    pub(crate) pc: u32,
    /// Retired-instruction total; informational. Stores to the LED port
    /// are discounted so the statistic stays comparable across guest
    /// builds with and without LED logging.
    pub(crate) retired: u64,
    pub(crate) watch: Option<u32>,
    pub(crate) logging: bool,
    config: MachineConfig,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// Creates a machine with the stock geometry, reset and ready to boot
    /// from ROM.
    #[must_use]
    pub fn new() -> Self {
        Self::build(MachineConfig::default())
    }

    /// Creates a machine with the given geometry.
    pub fn with_config(config: MachineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: MachineConfig) -> Self {
        Self {
            regs: RegisterFile::new(),
            csr: CsrFile::new(),
            bus: Bus::new(
                config.mem_size,
                config.display_start,
                config.fb_width_words(),
                config.fb_height,
                rom::boot_rom(),
            ),
            pc: ROM_START,
            retired: 0,
            watch: None,
            logging: false,
            config,
        }
    }

    /// Puts the machine back into its power-on state: PC at the reset
    /// vector, registers, CSRs and RAM zeroed, the whole screen marked
    /// dirty, keyboard queue and call trace emptied. Installed peripherals,
    /// switches, mouse state and the tick are host-owned and survive.
    pub fn reset(&mut self) {
        self.pc = ROM_START;
        self.regs.clear();
        self.csr.clear();
        self.bus.clear_ram();
        self.bus.damage_all();
        self.bus.io.clear_keyboard();
        self.bus.io.trace.clear();
        self.retired = 0;
    }

    /// Runs up to `cycles` instructions.
    ///
    /// The slice also ends early when the guest makes [`PROGRESS_BUDGET`]
    /// fruitless I/O polls, when a debug condition fires, or when the
    /// machine halts. See [`SliceExit`].
    pub fn execute(&mut self, cycles: u32) -> SliceExit {
        self.bus.io.progress = PROGRESS_BUDGET;
        for _ in 0..cycles {
            if self.bus.io.progress == 0 {
                break;
            }
            let Some(word) = self.bus.fetch(self.pc) else {
                error!("instruction fetch out of range: pc = {:#010x}", self.pc);
                self.bus.io.trace.dump();
                return SliceExit::Halted;
            };
            if word == HALT_WORD {
                debug!(
                    "cpu parked at pc = {:#010x} after {} instructions",
                    self.pc, self.retired
                );
                self.bus.io.trace.dump();
                return SliceExit::Halted;
            }
            let step = self.execute_one(Instruction(word));
            self.pc = self.pc.wrapping_add(4);
            self.retired = self.retired.wrapping_add(1);
            self.csr.retire();
            if matches!(step, Step::DebugBreak) {
                return SliceExit::Debug;
            }
        }
        SliceExit::Budget
    }

    // ---- peripheral installation ----

    /// Installs the LED device.
    pub fn set_led(&mut self, led: Box<dyn Led>) {
        self.bus.io.devices.set_led(led);
    }

    /// Installs the RS-232 device.
    pub fn set_serial(&mut self, serial: Box<dyn Serial>) {
        self.bus.io.devices.set_serial(serial);
    }

    /// Installs an SPI device. Only channels 1 (disk) and 2 (network)
    /// exist; other indices are ignored.
    pub fn set_spi(&mut self, index: usize, spi: Box<dyn Spi>) {
        self.bus.io.devices.set_spi(index, spi);
    }

    /// Installs the clipboard device.
    pub fn set_clipboard(&mut self, clipboard: Box<dyn Clipboard>) {
        self.bus.io.devices.set_clipboard(clipboard);
    }

    // ---- host input ----

    /// Latches the switch bank the guest reads at boot.
    pub fn set_switches(&mut self, switches: u32) {
        self.bus.io.set_switches(switches);
    }

    /// Installs the millisecond counter for the coming slice. Must be
    /// non-decreasing over the life of the machine.
    pub fn set_time(&mut self, tick: u32) {
        self.bus.io.set_time(tick);
    }

    /// Enables or disables per-instruction disassembly traces.
    pub fn set_logging(&mut self, logging: bool) {
        self.logging = logging;
    }

    /// Arms (or disarms) the watch address: any store to it ends the slice
    /// with [`SliceExit::Debug`].
    pub fn set_watch(&mut self, watch: Option<u32>) {
        self.watch = watch;
    }

    /// Latches a new mouse position (coordinates clamped to 0..4096 by
    /// ignoring out-of-range axes).
    pub fn mouse_moved(&mut self, x: i32, y: i32) {
        self.bus.io.mouse_moved(x, y);
    }

    /// Latches a mouse button (1..=3) state.
    pub fn mouse_button(&mut self, button: u32, down: bool) {
        self.bus.io.mouse_button(button, down);
    }

    /// Queues keyboard scancodes; the batch is dropped if it would
    /// overflow the 16-byte queue.
    pub fn keyboard_input(&mut self, scancodes: &[u8]) {
        self.bus.io.keyboard_input(scancodes);
    }

    // ---- display ----

    /// The framebuffer as a read-only word slice (little-endian pixel
    /// packing, `fb_width / 32` words per line). Only read this between
    /// calls to [`Machine::execute`].
    #[must_use]
    pub fn framebuffer(&self) -> &[u32] {
        self.bus.framebuffer()
    }

    /// Returns the damage rectangle accumulated since the previous call
    /// and resets the tracker.
    pub fn take_damage(&mut self) -> Damage {
        self.bus.take_damage()
    }

    // ---- inspection and debugger support ----

    /// Current program counter.
    #[must_use]
    pub const fn pc(&self) -> u32 {
        self.pc
    }

    /// Points the program counter somewhere else (debugger verb).
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    /// Reads register `x{index}`.
    #[must_use]
    pub const fn register(&self, index: usize) -> u32 {
        self.regs.read(index)
    }

    /// Writes register `x{index}` (debugger verb; `x0` stays zero).
    pub fn set_register(&mut self, index: usize, value: u32) {
        self.regs.write(index, value);
    }

    /// Reads the CSR at `address`.
    #[must_use]
    pub fn csr(&self, address: usize) -> u32 {
        self.csr.read(address)
    }

    /// Total retired instructions (with the LED-store discount applied).
    #[must_use]
    pub const fn instruction_count(&self) -> u64 {
        self.retired
    }

    /// The geometry this machine was built with.
    #[must_use]
    pub const fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Reads a RAM or ROM word (debugger verb). Addresses outside both
    /// read as zero; this never touches I/O.
    #[must_use]
    pub fn read_word(&self, addr: u32) -> u32 {
        self.bus.fetch(addr).unwrap_or(0)
    }

    /// Stores a word through the bus (debugger/loader verb): framebuffer
    /// damage and I/O routing apply exactly as for a guest store.
    pub fn write_word(&mut self, addr: u32, value: u32) {
        self.bus.store_word(addr, value);
    }

    /// Logs the guest call trace, outermost frame first.
    pub fn dump_trace(&self) {
        self.bus.io.trace.dump();
    }

    /// Current guest call-trace depth.
    #[must_use]
    pub fn trace_depth(&self) -> usize {
        self.bus.io.trace.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::IO_START;
    use crate::registers::{CSR_CYCLE, CSR_CYCLEH};

    fn load(machine: &mut Machine, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            machine.write_word(i as u32 * 4, word);
        }
        machine.set_pc(0);
    }

    #[test]
    fn test_boot_fetch_comes_from_rom() {
        let mut machine = Machine::new();
        assert_eq!(machine.pc(), ROM_START);
        machine.execute(1);
        assert_eq!(machine.instruction_count(), 1);
        // The stock image's first word is a plain instruction, so the PC
        // moved to the second ROM word.
        assert_eq!(machine.pc(), ROM_START + 4);
    }

    #[test]
    fn test_addi_chain_scenario() {
        let mut machine = Machine::new();
        load(&mut machine, &[0x0070_0093, 0xFFD0_8113]);
        machine.execute(3);
        assert_eq!(machine.register(1), 7);
        assert_eq!(machine.register(2), 4);
    }

    #[test]
    fn test_halt_word_ends_the_machine() {
        let mut machine = Machine::new();
        load(&mut machine, &[0x0000_006F]);
        assert_eq!(machine.execute(1), SliceExit::Halted);
        // The halt is a signal, not an instruction: nothing retired.
        assert_eq!(machine.instruction_count(), 0);
        // And the machine stays parked if driven again.
        assert_eq!(machine.execute(100), SliceExit::Halted);
    }

    #[test]
    fn test_fetch_out_of_range_halts() {
        let mut machine = Machine::new();
        machine.set_pc(0x0010_0000);
        assert_eq!(machine.execute(1), SliceExit::Halted);
    }

    #[test]
    fn test_damage_scenario() {
        let mut machine = Machine::new();
        machine.take_damage();
        machine.write_word(0x000E_7F00 + 4 * (32 * 10 + 5), 1);
        let d = machine.take_damage();
        assert_eq!((d.x1, d.y1, d.x2, d.y2), (5, 10, 5, 10));
        let d = machine.take_damage();
        assert_eq!((d.x1, d.x2, d.y1, d.y2), (32, 0, 768, 0));
        assert!(d.is_empty());
    }

    #[test]
    fn test_first_frame_is_fully_dirty() {
        let mut machine = Machine::new();
        let d = machine.take_damage();
        assert_eq!((d.x1, d.y1, d.x2, d.y2), (0, 0, 31, 767));
    }

    #[test]
    fn test_progress_budget_bounces_a_timer_poll_loop() {
        let mut machine = Machine::new();
        // x5 = IO base; loop: lw x6, 0(x5); jal x0, -4
        load(&mut machine, &[0xFC00_0293, 0x0002_A303, 0xFFDF_F06F]);
        let exit = machine.execute(1_000_000);
        assert_eq!(exit, SliceExit::Budget);
        // 20 fruitless timer reads plus loop overhead, nowhere near the
        // cycle budget.
        assert!(machine.instruction_count() < 100);
    }

    #[test]
    fn test_fresh_budget_every_slice() {
        let mut machine = Machine::new();
        load(&mut machine, &[0xFC00_0293, 0x0002_A303, 0xFFDF_F06F]);
        machine.execute(1_000_000);
        let after_first = machine.instruction_count();
        machine.execute(1_000_000);
        assert!(machine.instruction_count() > after_first);
    }

    #[test]
    fn test_keyboard_reaches_guest() {
        let mut machine = Machine::new();
        machine.keyboard_input(&[0x42]);
        // x5 = IO base; lw x6, 28(x5); sw x6, 64(x0); halt
        load(
            &mut machine,
            &[0xFC00_0293, 0x01C2_A303, 0x0460_2023, 0x0000_006F],
        );
        assert_eq!(machine.execute(10), SliceExit::Halted);
        assert_eq!(machine.read_word(64), 0x42);
    }

    #[test]
    fn test_mouse_reaches_guest() {
        let mut machine = Machine::new();
        machine.mouse_moved(123, 456);
        machine.mouse_button(2, true);
        // x5 = IO base; lw x6, 24(x5); sw x6, 64(x0); halt
        load(
            &mut machine,
            &[0xFC00_0293, 0x0182_A303, 0x0460_2023, 0x0000_006F],
        );
        machine.execute(10);
        let word = machine.read_word(64);
        assert_eq!(word & 0xFFF, 123);
        assert_eq!((word >> 12) & 0xFFF, 456);
        assert_ne!(word & (1 << 25), 0);
    }

    #[test]
    fn test_switches_reach_guest() {
        let mut machine = Machine::new();
        machine.set_switches(0xA5);
        // x5 = IO base; lw x6, 4(x5); sw x6, 64(x0); halt
        load(
            &mut machine,
            &[0xFC00_0293, 0x0042_A303, 0x0460_2023, 0x0000_006F],
        );
        machine.execute(10);
        assert_eq!(machine.read_word(64), 0xA5);
    }

    #[test]
    fn test_tick_reaches_guest() {
        let mut machine = Machine::new();
        machine.set_time(98765);
        // x5 = IO base; lw x6, 0(x5); sw x6, 64(x0); halt
        load(
            &mut machine,
            &[0xFC00_0293, 0x0002_A303, 0x0460_2023, 0x0000_006F],
        );
        machine.execute(10);
        assert_eq!(machine.read_word(64), 98765);
    }

    #[test]
    fn test_trace_protocol_scenario() {
        let mut machine = Machine::new();
        machine.write_word(IO_START + 32, 0xAA00_0041);
        machine.write_word(IO_START + 32, 0xAA00_0042);
        machine.write_word(IO_START + 32, 0xCC00_0064);
        assert_eq!(machine.trace_depth(), 1);
        machine.write_word(IO_START + 32, 0);
        assert_eq!(machine.trace_depth(), 0);
    }

    #[test]
    fn test_cycle_counter_tracks_retired_instructions() {
        let mut machine = Machine::new();
        load(&mut machine, &[0x0000_0013, 0x0000_0013, 0x0000_0013]);
        machine.execute(3);
        assert_eq!(machine.csr(CSR_CYCLE), 3);
        assert_eq!(machine.csr(CSR_CYCLEH), 0);
    }

    #[test]
    fn test_led_store_discounts_instruction_count() {
        let mut machine = Machine::new();
        // Five nops, then x1 = 1; x5 = IO base; sw x1, 4(x5)
        load(
            &mut machine,
            &[
                0x0000_0013,
                0x0000_0013,
                0x0000_0013,
                0x0000_0013,
                0x0000_0013,
                0x0010_0093, // addi x1, x0, 1
                0xFC00_0293, // addi x5, x0, -64
                0x0012_A223, // sw x1, 4(x5)
            ],
        );
        machine.execute(8);
        // 8 retired, minus 3 for the LED store.
        assert_eq!(machine.instruction_count(), 5);
        // The cycle CSR is not discounted.
        assert_eq!(machine.csr(CSR_CYCLE), 8);
    }

    #[test]
    fn test_wide_led_store_discounts_one_more() {
        let mut machine = Machine::new();
        load(
            &mut machine,
            &[
                0x0000_0013,
                0x0000_0013,
                0x0000_0013,
                0x0000_0013,
                0x0000_0013,
                0x0001_00B7, // lui x1, 0x10 -> 0x10000 > 0xFFFF
                0xFC00_0293, // addi x5, x0, -64
                0x0012_A223, // sw x1, 4(x5)
            ],
        );
        machine.execute(8);
        assert_eq!(machine.instruction_count(), 4);
    }

    #[test]
    fn test_reset_restores_power_on_state() {
        let mut machine = Machine::new();
        load(&mut machine, &[0x0070_0093]);
        machine.keyboard_input(&[1, 2, 3]);
        machine.execute(1);
        assert_ne!(machine.register(1), 0);

        machine.reset();
        assert_eq!(machine.pc(), ROM_START);
        assert_eq!(machine.register(1), 0);
        assert_eq!(machine.csr(CSR_CYCLE), 0);
        assert_eq!(machine.instruction_count(), 0);
        assert_eq!(machine.read_word(0), 0);
        let d = machine.take_damage();
        assert_eq!((d.x1, d.y1), (0, 0));
    }

    #[test]
    fn test_config_validation() {
        let ok = MachineConfig::default();
        assert!(Machine::with_config(ok).is_ok());

        let bad = MachineConfig {
            display_start: 0x0010_0000,
            ..ok
        };
        assert!(matches!(
            Machine::with_config(bad),
            Err(ConfigError::DisplayPastRam { .. })
        ));

        let bad = MachineConfig {
            fb_width: 100,
            ..ok
        };
        assert!(matches!(
            Machine::with_config(bad),
            Err(ConfigError::BadGeometry { .. })
        ));

        let bad = MachineConfig {
            display_start: 0x000F_F000,
            ..ok
        };
        assert!(matches!(
            Machine::with_config(bad),
            Err(ConfigError::FramebufferPastRam { .. })
        ));

        let bad = MachineConfig {
            mem_size: 0x0010_0002,
            ..ok
        };
        assert!(matches!(
            Machine::with_config(bad),
            Err(ConfigError::UnalignedMemSize(_))
        ));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config: MachineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MachineConfig::default());

        let config: MachineConfig =
            serde_json::from_str(r#"{"mem_size": 2097152, "display_start": 1998592}"#).unwrap();
        assert_eq!(config.mem_size, 0x0020_0000);
        assert_eq!(config.fb_width, 1024);
        assert!(Machine::with_config(config).is_ok());
    }

    #[test]
    fn test_framebuffer_len_matches_geometry() {
        let machine = Machine::new();
        assert_eq!(
            machine.framebuffer().len(),
            ((0x0010_0000 - 0x000E_7F00) / 4) as usize
        );
    }

    #[test]
    fn test_pc_stays_word_aligned() {
        let mut machine = Machine::new();
        // x1 = 9; jalr x0, x1, 0 lands on 8.
        load(&mut machine, &[0x0090_0093, 0x0000_8067, 0x0000_0013]);
        machine.execute(3);
        assert_eq!(machine.pc() % 4, 0);
    }

    #[test]
    fn test_csr_counter_wide_retire() {
        let mut machine = Machine::new();
        // Drive the low counter near wrap, then retire across it.
        machine.csr.csr_set_for_test(CSR_CYCLE, u32::MAX - 1);
        load(&mut machine, &[0x0000_0013, 0x0000_0013, 0x0000_0013]);
        machine.execute(3);
        assert_eq!(machine.csr(CSR_CYCLE), 1);
        assert_eq!(machine.csr(CSR_CYCLEH), 1);
    }
}
