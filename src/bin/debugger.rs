use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use famicore::config::{DEFAULT_CONFIG_FILE, EmulatorConfig};
use famicore::nes::Nes;
use tracing_subscriber::EnvFilter;

const UNTIL_LIMIT: usize = 1_000_000;

fn parse_addr(text: &str) -> Result<u16> {
    let digits = text.trim_start_matches('$').trim_start_matches("0x");
    u16::from_str_radix(digits, 16).with_context(|| format!("bad address: {text}"))
}

fn parse_count(text: Option<&&str>) -> Result<usize> {
    match text {
        Some(text) => text
            .parse()
            .with_context(|| format!("bad count: {text}")),
        None => Ok(1),
    }
}

fn print_regs(nes: &Nes) {
    let cpu = nes.cpu();
    let p = cpu.p;
    println!(
        "PC=${:04X} A=${:02X} X=${:02X} Y=${:02X} SP=${:02X} P={:08b} (NV-BDIZC) cyc={}",
        cpu.pc,
        cpu.a,
        cpu.x,
        cpu.y,
        cpu.sp,
        p,
        cpu.total_cycles()
    );
}

fn dump(nes: &Nes, addr: u16, len: usize) {
    for row in (0..len).step_by(16) {
        let start = addr.wrapping_add(row as u16);
        let bytes: Vec<String> = (0..16.min(len - row))
            .map(|i| format!("{:02X}", nes.debug_peek(start.wrapping_add(i as u16))))
            .collect();
        println!("{start:04X}: {}", bytes.join(" "));
    }
}

fn run_command(nes: &mut Nes, parts: &[&str]) -> Result<bool> {
    match parts[0] {
        "help" | "h" => {
            println!("  step, s [n]        step n instructions");
            println!("  frame, f [n]       run n frames");
            println!("  until, u <addr>    step until PC == addr");
            println!("  regs, r            CPU registers");
            println!("  mem, m <addr> [n]  dump n bytes of CPU space");
            println!("  ppu                PPU position and registers");
            println!("  mapper             mapper state");
            println!("  reset              soft reset");
            println!("  quit, q");
        }
        "step" | "s" => {
            for _ in 0..parse_count(parts.get(1))? {
                nes.step_instruction()?;
            }
            print_regs(nes);
        }
        "frame" | "f" => {
            for _ in 0..parse_count(parts.get(1))? {
                nes.run_frame()?;
            }
            print_regs(nes);
        }
        "until" | "u" => {
            let Some(target) = parts.get(1) else {
                bail!("usage: until <addr>");
            };
            let target = parse_addr(target)?;
            let mut steps = 0;
            while nes.cpu().pc != target && steps < UNTIL_LIMIT {
                nes.step_instruction()?;
                steps += 1;
            }
            if nes.cpu().pc != target {
                println!("gave up after {steps} instructions");
            }
            print_regs(nes);
        }
        "regs" | "r" => print_regs(nes),
        "mem" | "m" => {
            let Some(addr) = parts.get(1) else {
                bail!("usage: mem <addr> [len]");
            };
            let len = match parts.get(2) {
                Some(len) => len.parse().with_context(|| format!("bad length: {len}"))?,
                None => 64,
            };
            dump(nes, parse_addr(addr)?, len);
        }
        "ppu" => {
            let ppu = nes.ppu();
            let (scanline, dot) = ppu.position();
            let (ctrl, mask, status, oam_addr) = ppu.debug_registers();
            let (v, t, fine_x, w) = ppu.debug_scroll();
            println!("scanline={scanline} dot={dot} odd_frame={}", ppu.odd_frame());
            println!("ctrl={ctrl:08b} mask={mask:08b} status={status:08b} oamaddr=${oam_addr:02X}");
            println!("v=${v:04X} t=${t:04X} x={fine_x} w={w}");
        }
        "mapper" => println!("{}: {}", nes.mapper_name(), nes.mapper_state()),
        "reset" => {
            nes.reset();
            print_regs(nes);
        }
        "quit" | "q" => return Ok(false),
        other => println!("unknown command: {other} (try 'help')"),
    }
    Ok(true)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let Some(rom_path) = std::env::args().nth(1) else {
        println!("Usage: famicore_debug <rom.nes>");
        return Ok(());
    };

    let config = EmulatorConfig::load_or_default(Path::new(DEFAULT_CONFIG_FILE))?;
    let mut nes = Nes::from_path(Path::new(&rom_path), &config)?;
    println!("Loaded {rom_path} ({}, {:?})", nes.mapper_name(), nes.tv_system());
    print_regs(&nes);

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match run_command(&mut nes, &parts) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => println!("error: {err:#}"),
        }
    }

    Ok(())
}
