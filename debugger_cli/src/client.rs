//! The interactive command loop
//!
//! Commands mutate the registry and filters between stops; resume-style
//! commands arm the temporary slot and hand control to the coordinator.

use std::io::Write;
use std::sync::{Arc, Mutex};

use debugger_core::predictor::{self, StepMode};
use debugger_core::{
    eval, memory, DebugError, HwBreakpointKind, LibraryId, Session, ThreadFilter,
};

use crate::display::{self, DisplayInfo, UserConfig};

const INSTALL_HINTS: &str = "Possible reasons:
1. Some instructions do not host a uprobe. Try another instruction, or use until to skip past this one.
2. A breakpoint has an invalid address. Check the breakpoint list with info b.";

pub struct Client {
    pub session: Arc<Session>,
    pub default_library: LibraryId,
    pub config: Arc<Mutex<UserConfig>>,
    previous_command: String,
}

impl Client {
    pub fn new(session: Arc<Session>, default_library: LibraryId) -> Self {
        Self {
            session,
            default_library,
            config: Arc::new(Mutex::new(UserConfig::default())),
            previous_command: String::new(),
        }
    }

    /// Blocking prompt loop; returns when the user quits
    pub fn repl(&mut self) {
        let stdin = std::io::stdin();
        loop {
            print!("(adbg) ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if !self.execute(line.trim()) {
                break;
            }
        }
    }

    /// Dispatch one command line. Returns false when the session should end.
    pub fn execute(&mut self, line: &str) -> bool {
        // An empty line repeats the previous command
        let line = if line.is_empty() {
            self.previous_command.clone()
        } else {
            self.previous_command = line.to_string();
            line.to_string()
        };
        if line.is_empty() {
            return true;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let (command, args) = (parts[0], &parts[1..]);
        match command {
            "break" | "b" => self.handle_break(args),
            "hbreak" | "hb" => self.handle_hbreak(args, HwBreakpointKind::Execute),
            "watch" => self.handle_hbreak(args, HwBreakpointKind::Write),
            "rwatch" => self.handle_hbreak(args, HwBreakpointKind::Read),
            "step" | "s" => {
                if self.arm_step(StepMode::Into) {
                    self.handle_continue();
                }
            }
            "next" | "n" => {
                if self.arm_step(StepMode::Over) {
                    self.handle_continue();
                }
            }
            "finish" | "fi" => {
                if self.arm_finish() {
                    self.handle_continue();
                }
            }
            "until" | "u" => {
                if self.arm_until(args) {
                    self.handle_continue();
                }
            }
            "continue" | "c" => {
                self.handle_continue();
            }
            "delete" => self.handle_delete(args),
            "enable" => self.handle_change(args, true),
            "disable" => self.handle_change(args, false),
            "info" | "i" => self.handle_info(args),
            "thread" | "t" => self.handle_thread(args),
            "display" | "disp" => self.handle_display(args),
            "undisplay" | "undisp" => self.handle_undisplay(args),
            "examine" | "x" => self.handle_memory(args),
            "dump" => self.handle_dump(args),
            "write" | "w" => self.handle_write(args),
            "set" => self.handle_set(args),
            "list" | "l" | "dis" | "disassemble" => self.handle_list(args),
            "quit" | "q" => {
                self.session.shutdown();
                return false;
            }
            "run" | "r" => println!("adbg does not spawn targets. Start the app yourself."),
            "jump" | "j" | "return" => {
                println!("Command {} is not supported: adbg cannot modify the target.", command)
            }
            "backtrace" | "bt" => println!("Command backtrace is coming soon..."),
            _ => println!("Unknown command: {}", command),
        }
        true
    }

    fn handle_break(&self, args: &[&str]) {
        let token = match args.first() {
            Some(token) => token,
            None => {
                println!("Usage: break <address>");
                return;
            }
        };
        let ctx = self.session.context.lock().unwrap().clone();
        let address = match self
            .session
            .process
            .parse_user_address(token, self.default_library, &ctx)
        {
            Ok(address) => address,
            Err(e) => {
                println!("Failed to parse address: {}", e);
                return;
            }
        };
        let mut manager = self.session.manager.lock().unwrap();
        match manager.add(&address, true, debugger_core::BreakpointKind::Uprobe) {
            Ok(id) => {
                let libraries = self.session.process.libraries.lock().unwrap();
                let name = address
                    .library
                    .map(|l| libraries.name(l).to_string())
                    .unwrap_or_default();
                println!("Breakpoint {} at {}+{:#x}", id, name, address.offset);
            }
            Err(e) => println!("Failed to set breakpoint: {}", e),
        }
    }

    fn handle_hbreak(&self, args: &[&str], kind: HwBreakpointKind) {
        let token = match args.first() {
            Some(token) => token,
            None => {
                println!("Usage: hbreak/watch/rwatch <address>");
                return;
            }
        };
        let ctx = self.session.context.lock().unwrap().clone();
        let mut address = match self
            .session
            .process
            .parse_user_address(token, self.default_library, &ctx)
        {
            Ok(address) => address,
            Err(e) => {
                println!("Failed to parse address: {}", e);
                return;
            }
        };
        if address.absolute == 0 {
            match self.session.process.absolute_address(&address) {
                Ok(absolute) => address.absolute = absolute,
                Err(e) => {
                    println!("Failed to get absolute address: {}", e);
                    return;
                }
            }
        }
        let mut manager = self.session.manager.lock().unwrap();
        match manager.add(&address, true, debugger_core::BreakpointKind::Hardware(kind)) {
            Ok(id) => println!("Hardware breakpoint {} at {:#x}", id, address.absolute),
            Err(e) => println!("Failed to set breakpoint: {}", e),
        }
    }

    /// Arm the temporary slot for step/next. Returns true when a resume
    /// should follow.
    fn arm_step(&self, mode: StepMode) -> bool {
        let ctx = self.session.context.lock().unwrap().clone();
        if !ctx.regs_valid {
            println!("The target has not stopped at a breakpoint yet.");
            return false;
        }
        let process = &self.session.process;
        let pid = process.work_pid();
        let tid = process.work_tid();

        let next = match predictor::predict(pid, &ctx, mode) {
            Ok(next) => next,
            Err(e) => {
                println!("Failed to predict next address: {}", e);
                return false;
            }
        };

        if next == predictor::DATA_DEPENDENT {
            // Arm both successors; whichever fires first wins
            let target = match predictor::target(pid, &ctx) {
                Ok(target) => target,
                Err(e) => {
                    println!("Failed to get branch target: {}", e);
                    return false;
                }
            };
            let fallthrough = match process.parse_address(ctx.pc() + 4) {
                Ok(address) => address,
                Err(e) => {
                    println!("Failed to parse next pc: {}", e);
                    return false;
                }
            };
            let taken = match process.parse_address(target) {
                Ok(address) => address,
                Err(e) => {
                    println!("Failed to parse branch target: {}", e);
                    return false;
                }
            };
            let mut manager = self.session.manager.lock().unwrap();
            let mut armed = manager.set_temporary(fallthrough, tid);
            if armed.is_ok() {
                armed = manager.push_temporary(taken, tid);
            }
            if let Err(e) = armed {
                println!("Failed to set temporary breakpoint: {}", e);
                manager.clear_temporaries();
                return false;
            }
            return true;
        }

        let address = match process.parse_address(next) {
            Ok(address) => address,
            Err(e) => {
                println!("Failed to parse next pc: {}", e);
                return false;
            }
        };
        let mut manager = self.session.manager.lock().unwrap();
        if let Err(e) = manager.set_temporary(address, tid) {
            println!("Failed to set temporary breakpoint: {}", e);
            return false;
        }
        true
    }

    /// finish: run until the current function returns to LR
    fn arm_finish(&self) -> bool {
        let ctx = self.session.context.lock().unwrap().clone();
        if !ctx.regs_valid {
            println!("The target has not stopped at a breakpoint yet.");
            return false;
        }
        let address = match self.session.process.parse_address(ctx.lr()) {
            Ok(address) => address,
            Err(e) => {
                println!("Failed to parse lr: {}", e);
                return false;
            }
        };
        let tid = self.session.process.work_tid();
        let mut manager = self.session.manager.lock().unwrap();
        if let Err(e) = manager.set_temporary(address, tid) {
            println!("Failed to set temporary breakpoint: {}", e);
            return false;
        }
        true
    }

    fn arm_until(&self, args: &[&str]) -> bool {
        let token = match args.first() {
            Some(token) => token,
            None => {
                println!("Usage: until <address>");
                return false;
            }
        };
        let ctx = self.session.context.lock().unwrap().clone();
        let mut address = match self
            .session
            .process
            .parse_user_address(token, self.default_library, &ctx)
        {
            Ok(address) => address,
            Err(e) => {
                println!("Failed to parse address: {}", e);
                return false;
            }
        };
        if address.library.is_none() {
            println!("until needs a library-relative address.");
            return false;
        }
        if address.absolute == 0 {
            match self.session.process.absolute_address(&address) {
                Ok(absolute) => address.absolute = absolute,
                Err(e) => {
                    println!("Failed to resolve address: {}", e);
                    return false;
                }
            }
        }
        let tid = self.session.process.work_tid();
        let mut manager = self.session.manager.lock().unwrap();
        if let Err(e) = manager.set_temporary(address, tid) {
            println!("Failed to set temporary breakpoint: {}", e);
            return false;
        }
        true
    }

    fn handle_continue(&self) -> bool {
        match self.session.resume() {
            Ok(()) => true,
            Err(e) => {
                println!("Failed to continue: {}", e);
                if matches!(e, DebugError::Install { .. }) {
                    println!("{}", INSTALL_HINTS);
                }
                false
            }
        }
    }

    fn handle_delete(&self, args: &[&str]) {
        let id = match parse_id(args) {
            Some(id) => id,
            None => {
                println!("Usage: delete <breakpoint id>. Use info b to browse breakpoints.");
                return;
            }
        };
        if let Err(e) = self.session.manager.lock().unwrap().delete(id) {
            println!("{}", e);
        }
    }

    fn handle_change(&self, args: &[&str], enable: bool) {
        let id = match parse_id(args) {
            Some(id) => id,
            None => {
                println!("Usage: enable/disable <breakpoint id>. Use info b to browse breakpoints.");
                return;
            }
        };
        if let Err(e) = self.session.manager.lock().unwrap().change(id, enable) {
            println!("{}", e);
        }
    }

    fn handle_info(&self, args: &[&str]) {
        match args.first().copied() {
            Some("break") | Some("b") => self.print_breakpoints(),
            Some("reg") | Some("register") | Some("r") => {
                let ctx = self.session.context.lock().unwrap().clone();
                display::print_registers(&self.session.process, &ctx);
            }
            Some("thread") | Some("t") => {
                println!("Available threads:");
                self.print_threads();
                println!("Thread filters:");
                self.print_thread_filters();
            }
            _ => println!("Usage: info break/b\n       info register/reg/r\n       info thread/t"),
        }
    }

    fn print_breakpoints(&self) {
        let manager = self.session.manager.lock().unwrap();
        let libraries = self.session.process.libraries.lock().unwrap();
        for (id, breakpoint) in manager.list() {
            let marker = if breakpoint.enable { "[+]" } else { "[-]" };
            let kind = match breakpoint.kind {
                debugger_core::BreakpointKind::Uprobe => "",
                debugger_core::BreakpointKind::Hardware(HwBreakpointKind::Execute) => " (hw)",
                debugger_core::BreakpointKind::Hardware(HwBreakpointKind::Read) => " (rwatch)",
                debugger_core::BreakpointKind::Hardware(HwBreakpointKind::Write) => " (watch)",
            };
            match breakpoint.library {
                Some(lib) => println!(
                    "{} {}: {}+{:#x}{}",
                    marker,
                    id,
                    libraries.name(lib),
                    breakpoint.offset,
                    kind
                ),
                None => println!("{} {}: {:#x}{}", marker, id, breakpoint.offset, kind),
            }
        }
    }

    fn print_threads(&self) {
        match self.session.process.threads() {
            Ok(threads) => {
                for (i, thread) in threads.iter().enumerate() {
                    println!("[{}] {} {}", i, thread.tid, thread.name);
                }
            }
            Err(e) => println!("Failed to read threads: {}", e),
        }
    }

    fn print_thread_filters(&self) {
        let filters = self.session.filters.lock().unwrap();
        for (id, filter) in filters.iter().enumerate() {
            if !filter.enable {
                continue;
            }
            if filter.tid != 0 {
                println!("[{}] ThreadId: {}", id, filter.tid);
            } else if !filter.name.is_empty() {
                println!("[{}] ThreadName: {}", id, filter.name);
            }
        }
    }

    fn handle_thread(&self, args: &[&str]) {
        if args.is_empty() {
            self.print_threads();
            return;
        }
        if args.len() >= 2 {
            match args[0] {
                "add" | "+" => self.add_thread_filter(args[1]),
                "name" | "+n" => {
                    self.session.filters.lock().unwrap().push(ThreadFilter {
                        tid: 0,
                        name: args[1].to_string(),
                        enable: true,
                    });
                }
                "del" | "-" | "delete" => self.del_thread_filter(args[1]),
                _ => println!("Usage: thread add <id> | thread name <name> | thread del <id> | thread all"),
            }
            return;
        }
        if args[0] == "all" {
            self.session.filters.lock().unwrap().clear();
            return;
        }
        println!("Usage: thread add <id> | thread name <name> | thread del <id> | thread all");
    }

    fn add_thread_filter(&self, arg: &str) {
        let index = match arg.parse::<usize>() {
            Ok(index) => index,
            Err(e) => {
                println!("Bad id: {}", e);
                return;
            }
        };
        let threads = match self.session.process.threads() {
            Ok(threads) => threads,
            Err(e) => {
                println!("Failed to get threads: {}", e);
                return;
            }
        };
        let thread = match threads.get(index) {
            Some(thread) => thread,
            None => {
                println!("Bad id.");
                return;
            }
        };
        self.session.filters.lock().unwrap().push(ThreadFilter {
            tid: thread.tid,
            name: String::new(),
            enable: true,
        });
    }

    fn del_thread_filter(&self, arg: &str) {
        let index = match arg.parse::<usize>() {
            Ok(index) => index,
            Err(e) => {
                println!("Bad id: {}", e);
                return;
            }
        };
        let mut filters = self.session.filters.lock().unwrap();
        match filters.get_mut(index) {
            Some(filter) if filter.enable => filter.enable = false,
            _ => println!("Bad id."),
        }
    }

    fn handle_display(&self, args: &[&str]) {
        if args.is_empty() {
            println!("Usage: display <address> [len] [name]");
            return;
        }
        let ctx = self.session.context.lock().unwrap().clone();
        let address = match eval::eval(args[0], &ctx) {
            Ok(address) => address,
            Err(e) => {
                println!("{}", e);
                return;
            }
        };
        let mut info = DisplayInfo {
            name: String::new(),
            address,
            enable: true,
            len: 16,
        };
        if let Some(len_arg) = args.get(1) {
            match eval::eval(len_arg, &ctx) {
                Ok(len) => info.len = len as usize,
                Err(e) => {
                    println!("{}", e);
                    return;
                }
            }
        }
        if let Some(name) = args.get(2) {
            info.name = name.to_string();
        }
        self.config.lock().unwrap().displays.push(info);
    }

    fn handle_undisplay(&self, args: &[&str]) {
        let id = match parse_id(args) {
            Some(id) => id,
            None => {
                println!("Usage: undisplay <id>");
                return;
            }
        };
        let mut config = self.config.lock().unwrap();
        match config.displays.get_mut(id) {
            Some(display) if display.enable => display.enable = false,
            _ => println!("Invalid id."),
        }
    }

    fn handle_memory(&self, args: &[&str]) {
        if args.is_empty() {
            println!("Usage: x <address> [length|ptr|int|str]");
            return;
        }
        let ctx = self.session.context.lock().unwrap().clone();
        let address = match eval::eval(args[0], &ctx) {
            Ok(address) => address,
            Err(e) => {
                println!("{}", e);
                return;
            }
        };
        let pid = self.session.process.work_pid();

        let mut length = 16usize;
        if let Some(arg) = args.get(1) {
            match eval::eval(arg, &ctx) {
                Ok(len) => {
                    if len > 0x100000 {
                        println!("Invalid length");
                        return;
                    }
                    length = len as usize;
                }
                Err(_) => match *arg {
                    "ptr" => {
                        match memory::read(pid, address, 8) {
                            Ok(data) if data.len() == 8 => {
                                let value = u64::from_le_bytes(data.try_into().unwrap());
                                println!("{:#x}", value);
                            }
                            Ok(_) | Err(_) => println!("Reading memory error"),
                        }
                        return;
                    }
                    "int" => {
                        match memory::read(pid, address, 4) {
                            Ok(data) if data.len() == 4 => {
                                let value = u32::from_le_bytes(data.try_into().unwrap());
                                println!("{}", value);
                            }
                            Ok(_) | Err(_) => println!("Reading memory error"),
                        }
                        return;
                    }
                    "str" => {
                        self.print_string_at(address);
                        return;
                    }
                    other => {
                        println!("Invalid type or length: {}", other);
                        return;
                    }
                },
            }
        }

        match memory::read(pid, address, length) {
            Ok(data) => println!("{}", display::hexdump(address, &data)),
            Err(e) => println!("Reading memory error: {}", e),
        }
    }

    /// Read byte-wise until the first non-printable character
    fn print_string_at(&self, address: u64) {
        let pid = self.session.process.work_pid();
        let mut out = String::new();
        let mut cursor = address;
        loop {
            match memory::read(pid, cursor, 1) {
                Ok(data) if data.len() == 1 && data[0].is_ascii() && data[0] != 0 => {
                    let c = data[0] as char;
                    if c.is_control() {
                        break;
                    }
                    out.push(c);
                    cursor += 1;
                }
                _ => break,
            }
        }
        println!("{}", out);
    }

    fn handle_dump(&self, args: &[&str]) {
        if args.len() < 3 {
            println!("Usage: dump <address> <length> <filename>");
            return;
        }
        let ctx = self.session.context.lock().unwrap().clone();
        let address = match eval::eval(args[0], &ctx) {
            Ok(address) => address,
            Err(e) => {
                println!("{}", e);
                return;
            }
        };
        let length = match args[1].parse::<usize>() {
            Ok(length) if length > 0 => length,
            _ => {
                println!("Bad length");
                return;
            }
        };
        let data = match memory::read(self.session.process.work_pid(), address, length) {
            Ok(data) => data,
            Err(e) => {
                println!("Reading memory error: {}", e);
                return;
            }
        };
        match std::fs::write(args[2], &data) {
            Ok(()) => println!("Saved {} bytes to {}", data.len(), args[2]),
            Err(e) => println!("Failed to write to file: {}", e),
        }
    }

    fn handle_write(&self, args: &[&str]) {
        if args.len() < 2 {
            println!("Usage: write <address> <hexstring>");
            return;
        }
        let ctx = self.session.context.lock().unwrap().clone();
        let address = match eval::eval(args[0], &ctx) {
            Ok(address) => address,
            Err(e) => {
                println!("{}", e);
                return;
            }
        };
        let data = match display::hex_string_to_bytes(args[1]) {
            Ok(data) => data,
            Err(e) => {
                println!("Failed to parse hexstring {}: {}", args[1], e);
                return;
            }
        };
        match memory::write(self.session.process.work_pid(), address, &data) {
            Ok(n) => {
                println!("{} bytes written.", n);
                println!("{}", display::hexdump(address, &data[..n]));
            }
            Err(e) => println!("Writing memory error: {}", e),
        }
    }

    fn handle_set(&self, args: &[&str]) {
        if args.len() < 2 {
            println!("Usage: set <address> <name>");
            return;
        }
        let ctx = self.session.context.lock().unwrap().clone();
        let address = match self.session.process.parse_user_address_to_absolute(
            args[0],
            self.default_library,
            &ctx,
        ) {
            Ok(address) => address,
            Err(e) => {
                println!("Failed to parse address: {}", e);
                return;
            }
        };
        self.session
            .process
            .symbols
            .lock()
            .unwrap()
            .insert(address, args[1].to_string());
    }

    fn handle_list(&self, args: &[&str]) {
        let ctx = self.session.context.lock().unwrap().clone();
        let (address, count) = match args {
            [] => (ctx.pc(), 10),
            [addr] => match eval::eval(addr, &ctx) {
                Ok(address) => (address, 10),
                Err(e) => {
                    println!("{}", e);
                    return;
                }
            },
            [addr, len, ..] => {
                let address = match eval::eval(addr, &ctx) {
                    Ok(address) => address,
                    Err(e) => {
                        println!("{}", e);
                        return;
                    }
                };
                match eval::eval(len, &ctx) {
                    Ok(count) => (address, count as usize),
                    Err(e) => {
                        println!("{}", e);
                        return;
                    }
                }
            }
        };
        if address == 0 {
            println!("The target has not stopped at a breakpoint yet.");
            return;
        }
        display::print_disassembly(&self.session.process, address, count);
    }
}

fn parse_id(args: &[&str]) -> Option<usize> {
    args.first().and_then(|a| a.parse::<usize>().ok())
}
