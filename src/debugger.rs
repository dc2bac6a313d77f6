// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Interactive debugger REPL over the COMET II machine.
//!
//! Commands follow the gdb model: short and long names, prefix matching,
//! empty input repeats the last command, and the state-changing commands
//! are followed by a register dump. Bad arguments are warnings that leave
//! the machine untouched.

use std::fs::File;
use std::io::{self, BufRead, Write};

use crate::decoder::decode;
use crate::emulator::{Comet2, Console, StdConsole, StepOutcome};
use crate::objfile;

const DUMP_ROWS: usize = 16;
const DUMP_COLS: u16 = 8;
const DISASM_LINES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandOutcome {
    Continue,
    Quit,
}

struct Command {
    short: &'static str,
    long: &'static str,
    args: &'static str,
    help: &'static str,
    list_after: bool,
    handler: fn(&mut Debugger, &[&str]) -> CommandOutcome,
}

const COMMANDS: &[Command] = &[
    Command {
        short: "r",
        long: "run",
        args: "",
        help: "step until PC matches a breakpoint",
        list_after: true,
        handler: Debugger::cmd_run,
    },
    Command {
        short: "s",
        long: "step",
        args: "[N]",
        help: "execute N instructions (default 1)",
        list_after: true,
        handler: Debugger::cmd_step,
    },
    Command {
        short: "b",
        long: "break",
        args: "addr",
        help: "set a breakpoint at addr",
        list_after: false,
        handler: Debugger::cmd_break,
    },
    Command {
        short: "d",
        long: "delete",
        args: "[idx]",
        help: "delete breakpoint idx, or all",
        list_after: false,
        handler: Debugger::cmd_delete,
    },
    Command {
        short: "i",
        long: "info",
        args: "",
        help: "list breakpoints",
        list_after: false,
        handler: Debugger::cmd_info,
    },
    Command {
        short: "p",
        long: "print",
        args: "",
        help: "show PR, SP, FR, and GR0-GR7",
        list_after: false,
        handler: Debugger::cmd_print,
    },
    Command {
        short: "du",
        long: "dump",
        args: "[addr]",
        help: "dump 128 words of memory",
        list_after: false,
        handler: Debugger::cmd_dump,
    },
    Command {
        short: "st",
        long: "stack",
        args: "",
        help: "dump memory from SP",
        list_after: false,
        handler: Debugger::cmd_stack,
    },
    Command {
        short: "f",
        long: "file",
        args: "path",
        help: "load an object file",
        list_after: true,
        handler: Debugger::cmd_file,
    },
    Command {
        short: "j",
        long: "jump",
        args: "addr",
        help: "set PC to addr",
        list_after: true,
        handler: Debugger::cmd_jump,
    },
    Command {
        short: "m",
        long: "memory",
        args: "addr val",
        help: "store val at addr",
        list_after: true,
        handler: Debugger::cmd_memory,
    },
    Command {
        short: "di",
        long: "disasm",
        args: "[addr]",
        help: "disassemble 16 instructions",
        list_after: false,
        handler: Debugger::cmd_disasm,
    },
    Command {
        short: "h",
        long: "help",
        args: "",
        help: "show this list",
        list_after: false,
        handler: Debugger::cmd_help,
    },
    Command {
        short: "q",
        long: "quit",
        args: "",
        help: "exit the simulator",
        list_after: false,
        handler: Debugger::cmd_quit,
    },
];

/// Resolve a typed command name: exact short/long first, then a prefix of
/// the long form, both in table order.
fn find_command(name: &str) -> Option<&'static Command> {
    COMMANDS
        .iter()
        .find(|cmd| cmd.short == name || cmd.long == name)
        .or_else(|| COMMANDS.iter().find(|cmd| cmd.long.starts_with(name)))
}

/// Parse a REPL number argument: `#hhh…` hex or signed decimal, masked to
/// 16 bits.
pub fn expand_number(token: &str) -> Option<u16> {
    if let Some(hex) = token.strip_prefix('#') {
        // Normalise through an 0x-style radix parse.
        return u32::from_str_radix(hex, 16)
            .ok()
            .map(|value| (value & 0xffff) as u16);
    }
    token
        .parse::<i32>()
        .ok()
        .map(|value| (value & 0xffff) as u16)
}

/// The exact register dump produced by the `print` command.
pub fn format_registers<C: Console>(vm: &Comet2<C>) -> String {
    let decoded = decode(
        vm.mem[vm.pr as usize],
        vm.mem[vm.pr.wrapping_add(1) as usize],
    );
    let bits = vm.fr.bits();
    let mut out = String::new();
    out.push_str(&format!(
        "PR  #{:04x} [ {:<8} {:<15} ]\n",
        vm.pr, decoded.mnemonic, decoded.operands
    ));
    out.push_str(&format!(
        "SP  #{:04x}({:>6})  FR  {:03b}  ({:>5})\n",
        vm.sp, vm.sp, bits, bits
    ));
    for row in 0..2 {
        let fields: Vec<String> = (0..4)
            .map(|col| {
                let reg = row * 4 + col;
                format!("GR{} #{:04x}({:>5})", reg, vm.gr[reg], vm.gr[reg])
            })
            .collect();
        out.push_str(&fields.join("  "));
        out.push('\n');
    }
    out
}

/// One memory dump row: address, eight words, their low bytes as ASCII.
pub fn format_dump_row<C: Console>(vm: &Comet2<C>, addr: u16) -> String {
    let mut line = format!("#{addr:04x}");
    let mut ascii = String::new();
    for offset in 0..DUMP_COLS {
        let word = vm.mem[addr.wrapping_add(offset) as usize];
        line.push_str(&format!(" {word:04x}"));
        let byte = (word & 0xff) as u8;
        ascii.push(if (0x20..=0x7f).contains(&byte) {
            byte as char
        } else {
            '.'
        });
    }
    format!("{line}  {ascii}")
}

pub struct Debugger {
    vm: Comet2<StdConsole>,
    breakpoints: Vec<u16>,
    last_input: String,
    dump_addr: u16,
    halted: bool,
    quiet: bool,
}

impl Debugger {
    pub fn new(vm: Comet2<StdConsole>, quiet: bool) -> Self {
        Self {
            vm,
            breakpoints: Vec::new(),
            last_input: String::new(),
            dump_addr: 0,
            halted: false,
            quiet,
        }
    }

    pub fn vm_mut(&mut self) -> &mut Comet2<StdConsole> {
        &mut self.vm
    }

    /// Load an object file into the machine, reporting problems as
    /// warnings that leave the current state intact.
    pub fn load_path(&mut self, path: &str) -> bool {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                println!("Can't open \"{path}\": {err}");
                return false;
            }
        };
        let object = match objfile::read_object(file) {
            Ok(object) => object,
            Err(err) => {
                println!("Can't load \"{path}\": {err}");
                return false;
            }
        };
        if let Err(err) = self.vm.load(&object) {
            println!("Can't load \"{path}\": {err}");
            return false;
        }
        self.halted = false;
        true
    }

    /// The blocking read-eval-print loop. Returns on `quit` or EOF.
    pub fn repl(&mut self) -> io::Result<()> {
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("comet2> ");
            io::stdout().flush()?;
            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                println!();
                return Ok(());
            }
            let trimmed = line.trim();
            let input = if trimmed.is_empty() {
                self.last_input.clone()
            } else {
                self.last_input = trimmed.to_string();
                trimmed.to_string()
            };
            if input.is_empty() {
                continue;
            }
            if self.dispatch(&input) == CommandOutcome::Quit {
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, input: &str) -> CommandOutcome {
        let mut tokens = input.split_whitespace();
        let Some(name) = tokens.next() else {
            return CommandOutcome::Continue;
        };
        let args: Vec<&str> = tokens.collect();
        match find_command(name) {
            Some(cmd) => {
                let outcome = (cmd.handler)(self, &args);
                if cmd.list_after && !self.quiet {
                    print!("{}", format_registers(&self.vm));
                }
                outcome
            }
            None => {
                println!("Undefined command: \"{name}\". Try \"help\".");
                CommandOutcome::Continue
            }
        }
    }

    fn step_once(&mut self) -> bool {
        match self.vm.step() {
            Ok(StepOutcome::Running) => true,
            Ok(StepOutcome::Halted) => {
                println!("Program terminated.");
                self.halted = true;
                false
            }
            Err(err) => {
                println!("{err}");
                self.halted = true;
                false
            }
        }
    }

    fn cmd_run(&mut self, _args: &[&str]) -> CommandOutcome {
        if self.halted {
            println!("The program is not being run.");
            return CommandOutcome::Continue;
        }
        while self.step_once() {
            if let Some(index) = self.breakpoints.iter().position(|&bp| bp == self.vm.pr) {
                println!("Breakpoint {index}, #{:04x}", self.vm.pr);
                break;
            }
        }
        CommandOutcome::Continue
    }

    fn cmd_step(&mut self, args: &[&str]) -> CommandOutcome {
        let count = match args.first() {
            Some(token) => match expand_number(token) {
                Some(count) => count as u32,
                None => {
                    println!("Invalid count: \"{token}\"");
                    return CommandOutcome::Continue;
                }
            },
            None => 1,
        };
        if self.halted {
            println!("The program is not being run.");
            return CommandOutcome::Continue;
        }
        for _ in 0..count {
            if !self.step_once() {
                break;
            }
        }
        CommandOutcome::Continue
    }

    fn cmd_break(&mut self, args: &[&str]) -> CommandOutcome {
        let Some(token) = args.first() else {
            println!("break requires an address");
            return CommandOutcome::Continue;
        };
        match expand_number(token) {
            Some(addr) => {
                self.breakpoints.push(addr);
                println!(
                    "Breakpoint {} at #{addr:04x}",
                    self.breakpoints.len() - 1
                );
            }
            None => println!("Invalid address: \"{token}\""),
        }
        CommandOutcome::Continue
    }

    fn cmd_delete(&mut self, args: &[&str]) -> CommandOutcome {
        match args.first() {
            Some(token) => match token.parse::<usize>() {
                Ok(index) if index < self.breakpoints.len() => {
                    self.breakpoints.remove(index);
                }
                _ => println!("No breakpoint number {token}."),
            },
            None => {
                print!("Delete all breakpoints? (y or n) ");
                let _ = io::stdout().flush();
                let mut answer = String::new();
                let _ = io::stdin().lock().read_line(&mut answer);
                if answer.trim().eq_ignore_ascii_case("y") {
                    self.breakpoints.clear();
                }
            }
        }
        CommandOutcome::Continue
    }

    fn cmd_info(&mut self, _args: &[&str]) -> CommandOutcome {
        if self.breakpoints.is_empty() {
            println!("No breakpoints.");
            return CommandOutcome::Continue;
        }
        println!("Num  Address");
        for (index, addr) in self.breakpoints.iter().enumerate() {
            println!("{index:3}  #{addr:04x}");
        }
        CommandOutcome::Continue
    }

    fn cmd_print(&mut self, _args: &[&str]) -> CommandOutcome {
        print!("{}", format_registers(&self.vm));
        CommandOutcome::Continue
    }

    fn cmd_dump(&mut self, args: &[&str]) -> CommandOutcome {
        let start = match args.first() {
            Some(token) => match expand_number(token) {
                Some(addr) => addr,
                None => {
                    println!("Invalid address: \"{token}\"");
                    return CommandOutcome::Continue;
                }
            },
            None => self.dump_addr,
        };
        let mut addr = start;
        for _ in 0..DUMP_ROWS {
            println!("{}", format_dump_row(&self.vm, addr));
            addr = addr.wrapping_add(DUMP_COLS);
        }
        // Plain `dump` continues where the last one stopped.
        self.dump_addr = addr;
        CommandOutcome::Continue
    }

    fn cmd_stack(&mut self, _args: &[&str]) -> CommandOutcome {
        let mut addr = self.vm.sp;
        for _ in 0..DUMP_ROWS {
            println!("{}", format_dump_row(&self.vm, addr));
            addr = addr.wrapping_add(DUMP_COLS);
        }
        CommandOutcome::Continue
    }

    fn cmd_file(&mut self, args: &[&str]) -> CommandOutcome {
        match args.first() {
            Some(path) => {
                self.load_path(path);
            }
            None => println!("file requires a path"),
        }
        CommandOutcome::Continue
    }

    fn cmd_jump(&mut self, args: &[&str]) -> CommandOutcome {
        let Some(token) = args.first() else {
            println!("jump requires an address");
            return CommandOutcome::Continue;
        };
        match expand_number(token) {
            Some(addr) => {
                self.vm.pr = addr;
                self.halted = false;
            }
            None => println!("Invalid address: \"{token}\""),
        }
        CommandOutcome::Continue
    }

    fn cmd_memory(&mut self, args: &[&str]) -> CommandOutcome {
        let (Some(addr_tok), Some(val_tok)) = (args.first(), args.get(1)) else {
            println!("memory requires an address and a value");
            return CommandOutcome::Continue;
        };
        match (expand_number(addr_tok), expand_number(val_tok)) {
            (Some(addr), Some(value)) => self.vm.mem[addr as usize] = value,
            _ => println!("Invalid argument: \"{addr_tok} {val_tok}\""),
        }
        CommandOutcome::Continue
    }

    fn cmd_disasm(&mut self, args: &[&str]) -> CommandOutcome {
        let mut addr = match args.first() {
            Some(token) => match expand_number(token) {
                Some(addr) => addr,
                None => {
                    println!("Invalid address: \"{token}\"");
                    return CommandOutcome::Continue;
                }
            },
            None => self.vm.pr,
        };
        for _ in 0..DISASM_LINES {
            let decoded = decode(
                self.vm.mem[addr as usize],
                self.vm.mem[addr.wrapping_add(1) as usize],
            );
            println!("#{addr:04x}\t{:<8}{}", decoded.mnemonic, decoded.operands);
            addr = addr.wrapping_add(decoded.len);
        }
        CommandOutcome::Continue
    }

    fn cmd_help(&mut self, _args: &[&str]) -> CommandOutcome {
        for cmd in COMMANDS {
            println!(
                "{:2} | {:<6} {:<10} {}",
                cmd.short, cmd.long, cmd.args, cmd.help
            );
        }
        CommandOutcome::Continue
    }

    fn cmd_quit(&mut self, _args: &[&str]) -> CommandOutcome {
        CommandOutcome::Quit
    }
}

#[cfg(test)]
mod tests {
    use super::{expand_number, find_command, format_dump_row, format_registers};
    use crate::emulator::{Comet2, ScriptConsole};
    use crate::objfile::ObjectFile;

    fn vm_with(words: &[u16]) -> Comet2<ScriptConsole> {
        let mut vm = Comet2::with_console(ScriptConsole::default());
        vm.load(&ObjectFile {
            entry: 0,
            words: words.to_vec(),
        })
        .expect("load");
        vm
    }

    #[test]
    fn expand_number_handles_hex_and_decimal() {
        assert_eq!(expand_number("#ff00"), Some(0xff00));
        assert_eq!(expand_number("#5"), Some(5));
        assert_eq!(expand_number("10"), Some(10));
        assert_eq!(expand_number("-1"), Some(0xffff));
        assert_eq!(expand_number("+16"), Some(16));
        assert_eq!(expand_number("#zz"), None);
        assert_eq!(expand_number("ten"), None);
    }

    #[test]
    fn command_prefixes_resolve_in_table_order() {
        assert_eq!(find_command("s").map(|c| c.long), Some("step"));
        assert_eq!(find_command("st").map(|c| c.long), Some("stack"));
        assert_eq!(find_command("ste").map(|c| c.long), Some("step"));
        assert_eq!(find_command("sta").map(|c| c.long), Some("stack"));
        assert_eq!(find_command("d").map(|c| c.long), Some("delete"));
        assert_eq!(find_command("du").map(|c| c.long), Some("dump"));
        assert_eq!(find_command("di").map(|c| c.long), Some("disasm"));
        assert_eq!(find_command("r").map(|c| c.long), Some("run"));
        assert_eq!(find_command("run").map(|c| c.long), Some("run"));
        assert!(find_command("x").is_none());
    }

    #[test]
    fn register_dump_matches_the_fixed_layout() {
        let mut vm = vm_with(&[0x1010, 0x0004, 0x8100]);
        vm.gr[1] = 0x1234;
        vm.fr.zf = true;
        let text = format_registers(&vm);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "PR  #0000 [ LD       GR1, #0004      ]");
        assert_eq!(lines[1], "SP  #ff00( 65280)  FR  001  (    1)");
        assert_eq!(
            lines[2],
            "GR0 #0000(    0)  GR1 #1234( 4660)  GR2 #0000(    0)  GR3 #0000(    0)"
        );
        assert_eq!(
            lines[3],
            "GR4 #0000(    0)  GR5 #0000(    0)  GR6 #0000(    0)  GR7 #0000(    0)"
        );
    }

    #[test]
    fn dump_row_renders_ascii_for_printable_bytes() {
        let mut vm = vm_with(&[]);
        vm.mem[0x10] = 0x0041;
        vm.mem[0x11] = 0x0042;
        vm.mem[0x12] = 0x0001;
        let row = format_dump_row(&vm, 0x10);
        assert_eq!(
            row,
            "#0010 0041 0042 0001 0000 0000 0000 0000 0000  AB......"
        );
    }
}
