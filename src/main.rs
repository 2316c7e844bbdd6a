//! Headless driver for the oberon32 machine.
//!
//! Boots the embedded ROM and runs execution slices until the guest parks
//! the CPU or the slice bound is reached, feeding the machine wall-clock
//! milliseconds between slices. The serial port is bridged to stdout and
//! the LED bank to the log, which is enough to watch a textual guest come
//! up. Windowed display, keyboard capture and disk bridges belong to a
//! full host frontend, not this driver.
//!
//! Diagnostics go through `env_logger`; set `RUST_LOG=debug` (or
//! `RUST_LOG=trace` together with `--trace` for per-instruction
//! disassembly).

use clap::Parser;
use log::{debug, info};
use oberon32::{Led, Machine, MachineConfig, Serial, SliceExit};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "oberon32", about = "RISC-V Oberon workstation emulator", version)]
struct Args {
    /// JSON machine configuration file (fields: mem_size, display_start,
    /// fb_width, fb_height; missing fields use the stock geometry)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Instructions per execution slice
    #[arg(long, default_value_t = 8192)]
    cycles_per_slice: u32,

    /// Stop after this many slices (0 = run until the machine halts)
    #[arg(long, default_value_t = 0)]
    max_slices: u64,

    /// Initial switch bank value
    #[arg(long, default_value_t = 0)]
    switches: u32,

    /// Enable per-instruction disassembly traces
    #[arg(long)]
    trace: bool,
}

/// Serial port bridged to stdout. Never has receive data; transmit is
/// always ready.
struct StdoutSerial;

impl Serial for StdoutSerial {
    fn read_status(&mut self) -> u32 {
        0x2 // transmit ready
    }

    fn read_data(&mut self) -> u32 {
        0
    }

    fn write_data(&mut self, value: u32) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&[value as u8]);
        let _ = stdout.flush();
    }
}

/// LED bank bridged to the log.
struct LogLed;

impl Led for LogLed {
    fn write(&mut self, value: u32) {
        info!("leds: {:08b}", value & 0xFF);
    }
}

fn load_config(path: Option<&Path>) -> Result<MachineConfig, String> {
    let Some(path) = path else {
        return Ok(MachineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("reading {}: {err}", path.display()))?;
    serde_json::from_str(&text).map_err(|err| format!("parsing {}: {err}", path.display()))
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("oberon32: {err}");
            return ExitCode::from(2);
        }
    };
    let mut machine = match Machine::with_config(config) {
        Ok(machine) => machine,
        Err(err) => {
            eprintln!("oberon32: invalid configuration: {err}");
            return ExitCode::from(2);
        }
    };

    machine.set_logging(args.trace);
    machine.set_switches(args.switches);
    machine.set_serial(Box::new(StdoutSerial));
    machine.set_led(Box::new(LogLed));

    let start = Instant::now();
    let mut slices = 0u64;
    loop {
        machine.set_time(start.elapsed().as_millis() as u32);
        match machine.execute(args.cycles_per_slice) {
            SliceExit::Budget => {}
            SliceExit::Debug => {
                debug!("debug handoff at pc {:#010x}", machine.pc());
            }
            SliceExit::Halted => {
                info!(
                    "machine halted at pc {:#010x} after {} instructions",
                    machine.pc(),
                    machine.instruction_count()
                );
                return ExitCode::from(1);
            }
        }
        slices += 1;
        if args.max_slices != 0 && slices >= args.max_slices {
            info!("slice bound reached after {} instructions", machine.instruction_count());
            return ExitCode::SUCCESS;
        }
    }
}
