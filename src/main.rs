mod core;
mod log;

use clap::Parser;
use core::config::SimConfig;
use core::cpu::{BreakpointKind, Cpu, NullDebugHook};
use core::error::HostError;
use core::memory::bus::Bus;
use core::memory::Ram;
use std::process::ExitCode;
use tracing::info;

/// Step a 32-bit MIPS R4000 integer core over a memory image.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Memory image to load at the start of RAM.
    image_path: Option<String>,

    /// PC to start execution at. Defaults to the reset vector.
    #[arg(long)]
    pc: Option<String>,

    /// Number of steps to run.
    #[arg(long, default_value_t = 1_000_000)]
    steps: u64,

    /// Log level passed to the tracing subscriber.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional YAML config file; overrides the positional image path
    /// and flags above when present.
    #[arg(long)]
    config: Option<String>,
}

fn parse_hex_or_dec(text: &str) -> Result<u32, HostError> {
    let trimmed = text.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| HostError::Parm(e.to_string()))
    } else {
        trimmed.parse().map_err(|e: std::num::ParseIntError| HostError::Parm(e.to_string()))
    }
}

fn run() -> Result<(), HostError> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig {
            image_path: args
                .image_path
                .clone()
                .ok_or_else(|| HostError::Parm("no image path or --config given".into()))?,
            load_address: 0,
            initial_pc: args.pc.as_deref().map(parse_hex_or_dec).transpose()?,
            log_level: args.log_level.clone(),
            step_limit: Some(args.steps),
            breakpoints: Vec::new(),
        },
    };

    let logger = log::Logger::new(&config.log_level);
    let _ = &logger;

    let ram = Ram::load_from_file(&config.image_path, false)?;
    info!("loaded image md5={} len={}", ram.md5, ram.len());
    let mut bus = Bus::new(ram);

    let mut cpu = Cpu::new();
    if let Some(pc) = config.initial_pc {
        cpu.set_pc(pc);
    }
    for pc in &config.breakpoints {
        cpu.set_breakpoint(*pc, BreakpointKind::Simulator);
    }

    let steps = config.step_limit.unwrap_or(args.steps);
    let mut debug = NullDebugHook;
    for _ in 0..steps {
        cpu.step(&mut bus, &mut debug);
    }

    info!(
        "halted after {} steps at pc={:#010x}, hi={:#010x}, lo={:#010x}",
        steps, cpu.pc, cpu.hi, cpu.lo
    );
    for (index, value) in cpu.regs.iter().enumerate() {
        tracing::debug!("r{:<2} = {:#010x}", index, value);
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
