// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// CLI entrypoint for the comet2 simulator.

use std::fs::File;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use casl2::debugger::Debugger;
use casl2::emulator::Comet2;
use casl2::objfile::{self, ObjectFile};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const LONG_ABOUT: &str = "COMET II simulator with a gdb-style debugger.

Without a quiet flag the simulator prints its banner and enters the
interactive debugger, loading FILE when given. With -q or -Q it loads
FILE and runs it to completion.";

#[derive(Parser, Debug)]
#[command(
    name = "comet2",
    version = VERSION,
    disable_version_flag = true,
    about = "COMET II simulator and debugger",
    long_about = LONG_ABOUT
)]
struct Cli {
    #[arg(
        short = 'q',
        long = "quiet",
        action = ArgAction::SetTrue,
        long_help = "Run FILE to completion without the banner or debugger, keeping the IN > and OUT> prompts."
    )]
    quiet: bool,
    #[arg(
        short = 'Q',
        long = "very-quiet",
        action = ArgAction::SetTrue,
        long_help = "Like -q, and also suppress the IN > and OUT> prompts."
    )]
    very_quiet: bool,
    #[arg(
        short = 'v',
        long = "version",
        action = ArgAction::SetTrue,
        long_help = "Print the version and exit."
    )]
    version: bool,
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,
}

fn load_object(path: &PathBuf) -> Result<ObjectFile, String> {
    let file = File::open(path).map_err(|err| format!("Can't open \"{}\": {err}", path.display()))?;
    objfile::read_object(file).map_err(|err| format!("Can't load \"{}\": {err}", path.display()))
}

fn main() {
    let cli = Cli::parse();
    if cli.version {
        println!("comet2 version {VERSION}");
        return;
    }

    if cli.quiet || cli.very_quiet {
        let Some(path) = &cli.file else {
            eprintln!("-q and -Q require an object file");
            std::process::exit(1);
        };
        let object = match load_object(path) {
            Ok(object) => object,
            Err(msg) => {
                eprintln!("{msg}");
                std::process::exit(1);
            }
        };
        let mut vm = Comet2::new(!cli.very_quiet);
        if let Err(err) = vm.load(&object) {
            eprintln!("{err}");
            std::process::exit(1);
        }
        if let Err(err) = vm.run_to_halt() {
            eprintln!("{err}");
            std::process::exit(1);
        }
        return;
    }

    println!("comet2 COMET II simulator version {VERSION}");
    println!("Type \"help\" for a list of commands.");

    let vm = Comet2::new(true);
    let mut debugger = Debugger::new(vm, false);
    if let Some(path) = &cli.file {
        debugger.load_path(&path.to_string_lossy());
    }
    if let Err(err) = debugger.repl() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
