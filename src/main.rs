// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// CLI entrypoint for the casl2 assembler.

use std::fs::OpenOptions;
use std::io::{self, Write};

use clap::Parser;

use casl2::assembler::{run_with_cli, Cli, Diagnostic, OutputFormat, Severity, VERSION};

struct DiagnosticsSink {
    writer: Option<Box<dyn Write>>,
}

impl DiagnosticsSink {
    fn from_cli(cli: &Cli) -> io::Result<Self> {
        if cli.no_error {
            return Ok(Self { writer: None });
        }
        match &cli.error_file {
            Some(path) => {
                let mut opts = OpenOptions::new();
                opts.create(true).write(true);
                if cli.error_append {
                    opts.append(true);
                } else {
                    opts.truncate(true);
                }
                let file = opts.open(path)?;
                Ok(Self {
                    writer: Some(Box::new(file)),
                })
            }
            None => Ok(Self {
                writer: Some(Box::new(io::stderr())),
            }),
        }
    }

    fn emit_line(&mut self, line: &str) {
        if let Some(writer) = &mut self.writer {
            let _ = writeln!(writer, "{line}");
        }
    }

    fn emit_diagnostics(
        &mut self,
        diagnostics: &[Diagnostic],
        source_lines: &[String],
        format: OutputFormat,
        use_color: bool,
    ) {
        for diag in diagnostics {
            match format {
                OutputFormat::Text => {
                    self.emit_line(&diag.format_with_context(Some(source_lines), use_color))
                }
                OutputFormat::Json => self.emit_line(
                    &serde_json::json!({
                        "file": diag.file(),
                        "line": diag.line(),
                        "column": diag.column(),
                        "severity": match diag.severity() {
                            Severity::Warning => "warning",
                            Severity::Error => "error",
                        },
                        "message": diag.message(),
                    })
                    .to_string(),
                ),
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if cli.version {
        println!("casl2 version {VERSION}");
        return;
    }

    let mut sink = match DiagnosticsSink::from_cli(&cli) {
        Ok(sink) => sink,
        Err(err) => {
            eprintln!("Failed to open diagnostics sink: {err}");
            std::process::exit(1);
        }
    };

    let use_color = std::env::var("NO_COLOR").is_err();
    match run_with_cli(&cli) {
        Ok(report) => {
            sink.emit_diagnostics(
                report.diagnostics(),
                report.source_lines(),
                cli.format,
                use_color,
            );
        }
        Err(err) => {
            sink.emit_diagnostics(err.diagnostics(), err.source_lines(), cli.format, use_color);
            if cli.format == OutputFormat::Text {
                sink.emit_line(&err.to_string());
            }
            std::process::exit(1);
        }
    }
}
