//! Stop-time output: register, disassembly and watch-display panes

use std::sync::{Arc, Mutex};

use debugger_core::{memory, process::Process, RegisterContext, StopInfo};

use crate::disassemble::disasm;

pub const BLUE: &str = "\x1b[34m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";
pub const NC: &str = "\x1b[0m";

/// A memory range shown on every stop
#[derive(Clone, Debug)]
pub struct DisplayInfo {
    pub name: String,
    pub address: u64,
    pub enable: bool,
    pub len: usize,
}

/// What the display side prints on each stop
pub struct UserConfig {
    pub registers: bool,
    pub disasm: bool,
    pub displays: Vec<DisplayInfo>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            registers: true,
            disasm: true,
            displays: Vec::new(),
        }
    }
}

fn banner(title: &str) {
    println!(
        "{}──────────────────────────[ {} ]──────────────────────────{}",
        BLUE, title, NC
    );
}

/// Print the configured panes for a stop
pub fn print_stop(process: &Process, config: &Arc<Mutex<UserConfig>>, stop: &StopInfo) {
    let config = config.lock().unwrap();
    println!(
        "Thread {} hit breakpoint at {}",
        stop.tid,
        process.format_address(stop.context.pc())
    );
    if config.registers {
        banner("REGISTERS");
        print_registers(process, &stop.context);
    }
    if config.disasm {
        banner("DISASM");
        print_disassembly(process, stop.context.pc(), 10);
    }
    if config.displays.iter().any(|d| d.enable) {
        banner("DISPLAY");
        print_displays(process, &config.displays);
    }
    if config.registers || config.disasm {
        println!(
            "{}─────────────────────────────────────────────────────────{}",
            BLUE, NC
        );
    }
}

pub fn print_registers(process: &Process, ctx: &RegisterContext) {
    if !ctx.regs_valid {
        println!("No register context captured yet.");
        return;
    }
    for row in 0..11 {
        let mut line = String::new();
        for col in 0..3 {
            let idx = row * 3 + col;
            if idx > 30 {
                continue;
            }
            line.push_str(&format!("x{:<2} 0x{:016x}  ", idx, ctx.x(idx)));
        }
        println!("{}", line.trim_end());
    }
    println!("sp  0x{:016x}", ctx.sp());
    println!("pc  {}", process.format_address(ctx.pc()));
    if ctx.pstate_valid {
        println!(
            "pstate 0x{:08x} [{}{}{}{}]",
            ctx.regs.pstate,
            if ctx.flag_n() { 'N' } else { '-' },
            if ctx.flag_z() { 'Z' } else { '-' },
            if ctx.flag_c() { 'C' } else { '-' },
            if ctx.flag_v() { 'V' } else { '-' },
        );
    }
}

/// Disassemble `count` instructions starting at `address`
pub fn print_disassembly(process: &Process, address: u64, count: usize) {
    let code = match memory::read(process.work_pid(), address, count * 4) {
        Ok(code) => code,
        Err(e) => {
            println!("Failed to read code: {}", e);
            return;
        }
    };
    for (i, chunk) in code.chunks_exact(4).enumerate() {
        let insn_addr = address + (i * 4) as u64;
        let marker = if i == 0 {
            format!("{}>> ", GREEN)
        } else {
            "   ".to_string()
        };
        let location = process.format_address(insn_addr);
        match disasm([chunk[0], chunk[1], chunk[2], chunk[3]]) {
            Some(text) => {
                let (mnemonic, operands) = text.split_once(' ').unwrap_or((text.as_str(), ""));
                println!(
                    "{}{}{}\t{}{}{} {}{}{}",
                    marker, location, NC, YELLOW, mnemonic, NC, CYAN, operands, NC
                );
            }
            None => println!("{}{}{}\t(bad)", marker, location, NC),
        }
    }
}

pub fn print_displays(process: &Process, displays: &[DisplayInfo]) {
    for (id, display) in displays.iter().enumerate() {
        if !display.enable {
            continue;
        }
        println!("[{}] 0x{:x}:{}", id, display.address, display.name);
        match memory::read(process.work_pid(), display.address, display.len) {
            Ok(data) => println!("{}", hexdump(display.address, &data)),
            Err(e) => println!("Reading memory error: {}", e),
        }
    }
}

/// Classic 16-bytes-per-line dump with an ascii gutter
pub fn hexdump(base: u64, data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let mut hex = String::new();
        let mut ascii = String::new();
        for byte in chunk {
            hex.push_str(&format!("{:02x} ", byte));
            ascii.push(if byte.is_ascii_graphic() || *byte == b' ' {
                *byte as char
            } else {
                '.'
            });
        }
        out.push_str(&format!(
            "0x{:012x}  {:<48} |{}|\n",
            base + (i * 16) as u64,
            hex,
            ascii
        ));
    }
    out.trim_end().to_string()
}

/// Parse a `deadbeef` / `0xdeadbeef` style hex string into bytes
pub fn hex_string_to_bytes(text: &str) -> Result<Vec<u8>, String> {
    let text = text.strip_prefix("0x").unwrap_or(text);
    if text.is_empty() || text.len() % 2 != 0 {
        return Err(format!("odd-length hex string {:?}", text));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| format!("bad hex byte {:?}", &text[i..i + 2]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{hex_string_to_bytes, hexdump};

    #[test]
    pub fn when_hexdump_then_address_bytes_and_ascii_align() {
        let dump = hexdump(0x1000, b"Hi\x00\xff");
        assert!(dump.starts_with("0x000000001000"));
        assert!(dump.contains("48 69 00 ff"));
        assert!(dump.contains("|Hi..|"));
    }

    #[test]
    pub fn when_hexdump_spans_lines_then_each_line_gets_an_address() {
        let data = [0u8; 20];
        let dump = hexdump(0, &data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("0x000000000010"));
    }

    #[test]
    pub fn when_parse_hex_string_then_bytes_round_trip() {
        assert_eq!(
            hex_string_to_bytes("deadbeef").unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(hex_string_to_bytes("0x0102").unwrap(), vec![1, 2]);
        assert!(hex_string_to_bytes("abc").is_err());
        assert!(hex_string_to_bytes("zz").is_err());
        assert!(hex_string_to_bytes("").is_err());
    }
}
