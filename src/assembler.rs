// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// Assembler core pipeline and listing/output generation.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use crate::imagestore::{CellValue, ImageStore};
use crate::instructions::{lookup_mnemonic, opcode, InstType, REGISTER_FORM_OFFSET};
use crate::objfile;
use crate::scanner::{self, ScanError};
use crate::symbol_table::{
    parse_hex_word, parse_signed_decimal, pretty_name, SymbolTable, SymbolTableResult, CALL_PREFIX,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const LONG_ABOUT: &str = "CASL II assembler producing COMET II object files.

The input file must end with .cas; the object file <stem>.com is written
to the current directory (use -o to override the base name). Pass -a to
print an assembly listing with the defined-symbol table to stdout.";

#[derive(Parser, Debug)]
#[command(
    name = "casl2",
    version = VERSION,
    disable_version_flag = true,
    about = "CASL II assembler for the COMET II virtual machine",
    long_about = LONG_ABOUT
)]
pub struct Cli {
    #[arg(
        short = 'a',
        long = "listing",
        action = ArgAction::SetTrue,
        long_help = "Print an assembly listing (source line, address, emitted words, and the defined-symbol table) to standard output."
    )]
    pub listing: bool,
    #[arg(
        short = 'v',
        long = "version",
        action = ArgAction::SetTrue,
        long_help = "Print the version and exit."
    )]
    pub version: bool,
    #[arg(
        long = "format",
        value_enum,
        default_value_t = OutputFormat::Text,
        long_help = "Select diagnostic output format. text is default; json emits one JSON object per diagnostic."
    )]
    pub format: OutputFormat,
    #[arg(
        short = 'E',
        long = "error",
        value_name = "FILE",
        long_help = "Write diagnostics to FILE instead of stderr."
    )]
    pub error_file: Option<PathBuf>,
    #[arg(
        long = "error-append",
        action = ArgAction::SetTrue,
        requires = "error_file",
        long_help = "Append diagnostics to --error FILE instead of truncating it."
    )]
    pub error_append: bool,
    #[arg(
        long = "no-error",
        action = ArgAction::SetTrue,
        conflicts_with_all = ["error_file", "error_append"],
        long_help = "Disable all diagnostic output routing."
    )]
    pub no_error: bool,
    #[arg(
        short = 'o',
        long = "outfile",
        value_name = "BASE",
        long_help = "Output filename base for the .com object file. Defaults to the input base."
    )]
    pub outfile: Option<String>,
    #[arg(value_name = "FILE", required_unless_present = "version")]
    pub infile: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Run the assembler for a parsed command line.
pub fn run_with_cli(cli: &Cli) -> Result<AsmRunReport, AsmRunError> {
    let Some(infile) = cli.infile.as_ref() else {
        return Err(AsmRunError::new(
            AsmError::new(AsmErrorKind::Cli, "No input file specified", None),
            Vec::new(),
            Vec::new(),
        ));
    };
    let (asm_name, input_base) = input_base_from_path(infile)?;

    let source = fs::read_to_string(&asm_name).map_err(|_| {
        AsmRunError::new(
            AsmError::new(AsmErrorKind::Io, "Error opening file for read", Some(&asm_name)),
            Vec::new(),
            Vec::new(),
        )
    })?;

    let mut assembler = Assembler::new(&asm_name, &source);
    let pass1 = assembler.pass1();
    if pass1.errors > 0 {
        return Err(assembler.into_run_error());
    }
    let Some(resolved) = assembler.pass2() else {
        return Err(assembler.into_run_error());
    };

    let out_base = cli.outfile.as_deref().unwrap_or(&input_base);
    let out_path = format!("{out_base}.com");
    let out_file = File::create(&out_path).map_err(|_| {
        AsmRunError::new(
            AsmError::new(
                AsmErrorKind::Io,
                "Error opening file for write",
                Some(&out_path),
            ),
            Vec::new(),
            assembler.source_lines().to_vec(),
        )
    })?;
    objfile::write_object(out_file, resolved.entry, &resolved.words).map_err(|err| {
        AsmRunError::new(
            AsmError::new(AsmErrorKind::Io, &err.to_string(), None),
            Vec::new(),
            assembler.source_lines().to_vec(),
        )
    })?;

    if cli.listing {
        let stdout = io::stdout();
        let mut listing = ListingWriter::new(stdout.lock());
        listing
            .write_image(&resolved, assembler.source_lines())
            .and_then(|_| listing.write_symbols(assembler.symbols()))
            .map_err(|err| {
                AsmRunError::new(
                    AsmError::new(AsmErrorKind::Io, &err.to_string(), None),
                    Vec::new(),
                    assembler.source_lines().to_vec(),
                )
            })?;
    }

    Ok(AsmRunReport::new(
        assembler.take_diagnostics(),
        assembler.source_lines().to_vec(),
    ))
}

fn input_base_from_path(path: &PathBuf) -> Result<(String, String), AsmRunError> {
    let asm_name = path.to_string_lossy().to_string();
    let file_name = match path.file_name().and_then(|s| s.to_str()) {
        Some(name) => name,
        None => {
            return Err(AsmRunError::new(
                AsmError::new(AsmErrorKind::Cli, "Invalid input file name", None),
                Vec::new(),
                Vec::new(),
            ))
        }
    };
    if !file_name.ends_with(".cas") {
        return Err(AsmRunError::new(
            AsmError::new(AsmErrorKind::Cli, "Input file must end with .cas", None),
            Vec::new(),
            Vec::new(),
        ));
    }
    let base = file_name.strip_suffix(".cas").unwrap_or(file_name);
    Ok((asm_name, base.to_string()))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassCounts {
    pub lines: u32,
    pub errors: u32,
    pub warnings: u32,
}

impl PassCounts {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmErrorKind {
    Assembler,
    Cli,
    Directive,
    Instruction,
    Io,
    Scanner,
    Symbol,
}

#[derive(Debug, Clone)]
pub struct AsmError {
    kind: AsmErrorKind,
    message: String,
}

impl AsmError {
    pub fn new(kind: AsmErrorKind, msg: &str, param: Option<&str>) -> Self {
        Self {
            kind,
            message: format_error(msg, param),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> AsmErrorKind {
        self.kind
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AsmError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    line: u32,
    column: Option<usize>,
    severity: Severity,
    error: AsmError,
    file: Option<String>,
}

impl Diagnostic {
    pub fn new(line: u32, severity: Severity, error: AsmError) -> Self {
        Self {
            line,
            column: None,
            severity,
            error,
            file: None,
        }
    }

    pub fn with_column(mut self, column: Option<usize>) -> Self {
        self.column = column;
        self
    }

    pub fn with_file(mut self, file: Option<String>) -> Self {
        self.file = file;
        self
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> Option<usize> {
        self.column
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn message(&self) -> &str {
        self.error.message()
    }

    /// The one-line diagnostic contract: `file:line: message`.
    pub fn format(&self) -> String {
        match &self.file {
            Some(file) => format!("{file}:{}: {}", self.line, self.error.message()),
            None => format!("{}: {}", self.line, self.error.message()),
        }
    }

    pub fn format_with_context(&self, lines: Option<&[String]>, use_color: bool) -> String {
        let mut out = String::new();
        out.push_str(&self.format());
        for line in build_context_lines(self.line, self.column, lines, use_color) {
            out.push('\n');
            out.push_str(&line);
        }
        out
    }
}

pub struct AsmRunReport {
    diagnostics: Vec<Diagnostic>,
    source_lines: Vec<String>,
}

impl AsmRunReport {
    fn new(diagnostics: Vec<Diagnostic>, source_lines: Vec<String>) -> Self {
        Self {
            diagnostics,
            source_lines,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn source_lines(&self) -> &[String] {
        &self.source_lines
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .count()
    }
}

#[derive(Debug)]
pub struct AsmRunError {
    error: AsmError,
    diagnostics: Vec<Diagnostic>,
    source_lines: Vec<String>,
}

impl AsmRunError {
    fn new(error: AsmError, diagnostics: Vec<Diagnostic>, source_lines: Vec<String>) -> Self {
        Self {
            error,
            diagnostics,
            source_lines,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn source_lines(&self) -> &[String] {
        &self.source_lines
    }
}

impl fmt::Display for AsmRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for AsmRunError {}

/// The resolved output of pass 2: the entry point, the contiguous image
/// from address 0, and per-cell provenance for the listing.
pub struct ResolvedImage {
    pub entry: u16,
    pub words: Vec<u16>,
    cells: Vec<ResolvedCell>,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedCell {
    addr: u16,
    word: u16,
    line: u32,
}

/// Assemble a complete source text. Convenience wrapper used by embedders
/// and the integration tests; the CLI drives [`Assembler`] directly for
/// listing output.
pub fn assemble(source: &str, file: &str) -> Result<ResolvedImage, Vec<Diagnostic>> {
    let mut assembler = Assembler::new(file, source);
    let pass1 = assembler.pass1();
    if pass1.errors > 0 {
        return Err(assembler.take_diagnostics());
    }
    match assembler.pass2() {
        Some(resolved) => Ok(resolved),
        None => Err(assembler.take_diagnostics()),
    }
}

pub struct Assembler {
    symbols: SymbolTable,
    image: ImageStore,
    diagnostics: Vec<Diagnostic>,
    entry_symbol: Option<String>,
    file: String,
    source_lines: Vec<String>,
}

impl Assembler {
    pub fn new(file: &str, source: &str) -> Self {
        Self {
            symbols: SymbolTable::new(),
            image: ImageStore::new(),
            diagnostics: Vec::new(),
            entry_symbol: None,
            file: file.to_string(),
            source_lines: source.lines().map(|s| s.to_string()).collect(),
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn image(&self) -> &ImageStore {
        &self.image
    }

    pub fn source_lines(&self) -> &[String] {
        &self.source_lines
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    fn into_run_error(mut self) -> AsmRunError {
        AsmRunError::new(
            AsmError::new(
                AsmErrorKind::Assembler,
                "Errors detected in source. No object file created.",
                None,
            ),
            std::mem::take(&mut self.diagnostics),
            std::mem::take(&mut self.source_lines),
        )
    }

    /// Drive the line worker over the whole source: assign addresses and
    /// labels, expand macros, stage literals, emit provisional words.
    pub fn pass1(&mut self) -> PassCounts {
        let mut counts = PassCounts::new();
        let diagnostics = &mut self.diagnostics;
        let mut asm_line = AsmLine::new(&mut self.symbols, &mut self.image, &self.file);

        let mut line_num: u32 = 0;
        for src in &self.source_lines {
            line_num += 1;
            let status = asm_line.process(src, line_num);
            if status == LineStatus::Error {
                if let Some(err) = asm_line.error() {
                    diagnostics.push(
                        Diagnostic::new(line_num, Severity::Error, err.clone())
                            .with_file(Some(self.file.clone())),
                    );
                }
                counts.errors += 1;
            }
        }

        if !asm_line.seen_start {
            diagnostics.push(
                Diagnostic::new(
                    line_num,
                    Severity::Error,
                    AsmError::new(AsmErrorKind::Assembler, "No \"START\" instruction found", None),
                )
                .with_file(Some(self.file.clone())),
            );
            counts.errors += 1;
        } else if asm_line.in_block {
            diagnostics.push(
                Diagnostic::new(
                    line_num,
                    Severity::Error,
                    AsmError::new(AsmErrorKind::Assembler, "No \"END\" instruction found", None),
                )
                .with_file(Some(self.file.clone())),
            );
            counts.errors += 1;
        }

        self.entry_symbol = asm_line.entry_symbol.take();
        counts.lines = line_num;
        counts
    }

    /// Resolve every deferred cell and fold the image into the contiguous
    /// object words. Returns `None` after recording diagnostics.
    pub fn pass2(&mut self) -> Option<ResolvedImage> {
        let mut errors = 0u32;

        let entry = match &self.entry_symbol {
            Some(name) => match self.symbols.resolve(name) {
                Some(value) => value,
                None => {
                    let line = self.symbols.get(name).map(|e| e.line).unwrap_or(0);
                    self.diagnostics.push(
                        Diagnostic::new(
                            line,
                            Severity::Error,
                            AsmError::new(
                                AsmErrorKind::Symbol,
                                &format!("Label \"{}\" is not defined", pretty_name(name)),
                                None,
                            ),
                        )
                        .with_file(Some(self.file.clone())),
                    );
                    errors += 1;
                    0
                }
            },
            None => 0,
        };

        let mut cells = Vec::with_capacity(self.image.num_entries());
        for (addr, cell) in self.image.entries() {
            let word = match &cell.value {
                CellValue::Word(word) => *word,
                CellValue::Expr(expr) => match self.symbols.resolve(expr) {
                    Some(value) => value,
                    None => {
                        self.diagnostics.push(
                            Diagnostic::new(
                                cell.line,
                                Severity::Error,
                                AsmError::new(
                                    AsmErrorKind::Symbol,
                                    &format!("Undefined symbol \"{}\"", pretty_name(expr)),
                                    None,
                                ),
                            )
                            .with_file(Some(cell.file.clone())),
                        );
                        errors += 1;
                        0
                    }
                },
            };
            cells.push(ResolvedCell {
                addr,
                word,
                line: cell.line,
            });
        }

        if errors > 0 {
            return None;
        }

        let words = match self.image.output_range() {
            Some((_, max)) => {
                let mut words = vec![0u16; max as usize + 1];
                for cell in &cells {
                    words[cell.addr as usize] = cell.word;
                }
                words
            }
            None => Vec::new(),
        };

        Some(ResolvedImage {
            entry,
            words,
            cells,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStatus {
    Ok,
    NothingDone,
    Error,
}

struct StagedLiteral {
    /// Qualified pool-symbol name, `scope.=form`.
    name: String,
    /// The raw operand text including the leading `=`.
    form: String,
}

/// Per-line worker for pass 1. Owns the running address counter and the
/// block state (scope, literal stack, entry symbol) that spans lines.
struct AsmLine<'a> {
    symbols: &'a mut SymbolTable,
    image: &'a mut ImageStore,
    file: &'a str,
    addr: u16,
    scope: String,
    in_block: bool,
    seen_start: bool,
    literals: Vec<StagedLiteral>,
    entry_symbol: Option<String>,
    last_error: Option<AsmError>,
}

impl<'a> AsmLine<'a> {
    fn new(symbols: &'a mut SymbolTable, image: &'a mut ImageStore, file: &'a str) -> Self {
        Self {
            symbols,
            image,
            file,
            addr: 0,
            scope: String::new(),
            in_block: false,
            seen_start: false,
            literals: Vec::new(),
            entry_symbol: None,
            last_error: None,
        }
    }

    fn error(&self) -> Option<&AsmError> {
        self.last_error.as_ref()
    }

    fn process(&mut self, line: &str, line_num: u32) -> LineStatus {
        self.last_error = None;

        let parsed = match scanner::parse_line(line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return LineStatus::NothingDone,
            Err(ScanError::Syntax) => {
                return self.failure(AsmErrorKind::Scanner, "Syntax error", None)
            }
            Err(ScanError::InvalidLabel(name)) => {
                return self.failure(
                    AsmErrorKind::Scanner,
                    &format!("Invalid label \"{name}\""),
                    None,
                )
            }
        };

        let entry = match lookup_mnemonic(&parsed.mnemonic) {
            Some(entry) => entry,
            None => {
                return self.failure(
                    AsmErrorKind::Instruction,
                    &format!("Illegal instruction \"{}\"", parsed.mnemonic),
                    None,
                )
            }
        };

        if !self.in_block && entry.kind != InstType::Start {
            return self.failure(AsmErrorKind::Assembler, "No \"START\" instruction found", None);
        }

        let operands = scanner::split_operands(&parsed.operands);

        match entry.kind {
            InstType::Start => return self.dir_start(parsed.label.as_deref(), &operands, line_num),
            InstType::End => return self.dir_end(parsed.label.as_deref(), &operands, line_num),
            _ => {}
        }

        if let Some(label) = &parsed.label {
            let qualified = SymbolTable::qualify(&self.scope, label);
            if self.symbols.add_label(&qualified, self.addr, self.file, line_num)
                == SymbolTableResult::Duplicate
            {
                return self.failure(
                    AsmErrorKind::Symbol,
                    &format!("Label \"{}\" already defined", pretty_name(&qualified)),
                    None,
                );
            }
        }

        match entry.kind {
            InstType::Ds => self.dir_ds(&operands, line_num),
            InstType::Dc => self.dir_dc(&operands, line_num),
            InstType::In => self.expand_in_out(&operands, line_num, "#fff0"),
            InstType::Out => self.expand_in_out(&operands, line_num, "#fff2"),
            InstType::Rpush => self.expand_rpush(line_num),
            InstType::Rpop => self.expand_rpop(line_num),
            _ => self.emit_instruction(entry.mnemonic, entry.opcode, entry.kind, &operands, line_num),
        }
    }

    fn failure(&mut self, kind: AsmErrorKind, msg: &str, param: Option<&str>) -> LineStatus {
        self.last_error = Some(AsmError::new(kind, msg, param));
        LineStatus::Error
    }

    fn emit_word(&mut self, word: u16, line_num: u32) {
        self.image.store_word(self.addr, word, self.file, line_num);
        self.addr = self.addr.wrapping_add(1);
    }

    fn emit_expr(&mut self, expr: &str, line_num: u32) {
        self.image.store_expr(self.addr, expr, self.file, line_num);
        self.addr = self.addr.wrapping_add(1);
    }

    /// Rewrite one adr operand into its deferred form: stage literals,
    /// scope-qualify identifiers, pass numbers through untouched.
    fn operand_expr(&mut self, token: &str, call_target: bool) -> String {
        if token.starts_with('=') {
            let name = SymbolTable::qualify(&self.scope, token);
            if !self.literals.iter().any(|lit| lit.name == name) {
                self.literals.push(StagedLiteral {
                    name: name.clone(),
                    form: token.to_string(),
                });
            }
            return name;
        }
        if is_identifier(token) && parse_register(token).is_none() {
            let qualified = SymbolTable::qualify(&self.scope, token);
            if call_target {
                return format!("{CALL_PREFIX}{qualified}");
            }
            return qualified;
        }
        token.to_string()
    }

    fn emit_instruction(
        &mut self,
        mnemonic: &str,
        op: u8,
        kind: InstType,
        operands: &[String],
        line_num: u32,
    ) -> LineStatus {
        match kind {
            InstType::Op1 => {
                if operands.len() < 2 || operands.len() > 3 {
                    return self.failure(AsmErrorKind::Instruction, "Invalid operand", None);
                }
                let Some(gr) = parse_register(&operands[0]) else {
                    return self.failure(AsmErrorKind::Instruction, "Invalid operand", None);
                };
                let xr = match self.index_register(operands.get(2)) {
                    Ok(xr) => xr,
                    Err(status) => return status,
                };
                let adr = self.operand_expr(&operands[1], false);
                self.emit_word((op as u16) << 8 | (gr as u16) << 4 | xr as u16, line_num);
                self.emit_expr(&adr, line_num);
                LineStatus::Ok
            }
            InstType::Op2 => {
                if operands.is_empty() || operands.len() > 2 {
                    return self.failure(AsmErrorKind::Instruction, "Invalid operand", None);
                }
                let xr = match self.index_register(operands.get(1)) {
                    Ok(xr) => xr,
                    Err(status) => return status,
                };
                let adr = self.operand_expr(&operands[0], mnemonic == "CALL");
                self.emit_word((op as u16) << 8 | xr as u16, line_num);
                self.emit_expr(&adr, line_num);
                LineStatus::Ok
            }
            InstType::Op3 => {
                if operands.len() != 1 {
                    return self.failure(AsmErrorKind::Instruction, "Invalid operand", None);
                }
                let Some(gr) = parse_register(&operands[0]) else {
                    return self.failure(AsmErrorKind::Instruction, "Invalid operand", None);
                };
                self.emit_word((op as u16) << 8 | (gr as u16) << 4, line_num);
                LineStatus::Ok
            }
            InstType::Op4 => {
                if !operands.is_empty() {
                    return self.failure(AsmErrorKind::Instruction, "Invalid operand", None);
                }
                self.emit_word((op as u16) << 8, line_num);
                LineStatus::Ok
            }
            InstType::Op5 => {
                if operands.len() < 2 || operands.len() > 3 {
                    return self.failure(AsmErrorKind::Instruction, "Invalid operand", None);
                }
                let Some(gr) = parse_register(&operands[0]) else {
                    return self.failure(AsmErrorKind::Instruction, "Invalid operand", None);
                };
                if operands.len() == 2 {
                    if let Some(gr2) = parse_register(&operands[1]) {
                        let reg_op = (op + REGISTER_FORM_OFFSET) as u16;
                        self.emit_word(reg_op << 8 | (gr as u16) << 4 | gr2 as u16, line_num);
                        return LineStatus::Ok;
                    }
                }
                let xr = match self.index_register(operands.get(2)) {
                    Ok(xr) => xr,
                    Err(status) => return status,
                };
                let adr = self.operand_expr(&operands[1], false);
                self.emit_word((op as u16) << 8 | (gr as u16) << 4 | xr as u16, line_num);
                self.emit_expr(&adr, line_num);
                LineStatus::Ok
            }
            other => self.failure(
                AsmErrorKind::Assembler,
                &format!("Instruction type \"{other:?}\" is not implemented"),
                None,
            ),
        }
    }

    /// Parse an optional index-register operand. GR0 cannot index.
    fn index_register(&mut self, token: Option<&String>) -> Result<u8, LineStatus> {
        let Some(token) = token else {
            return Ok(0);
        };
        if token == "GR0" || token == "0" {
            return Err(self.failure(
                AsmErrorKind::Instruction,
                "Can't use GR0 as an index register",
                None,
            ));
        }
        match parse_register(token) {
            Some(xr) => Ok(xr),
            None => Err(self.failure(AsmErrorKind::Instruction, "Invalid operand", None)),
        }
    }

    fn dir_start(
        &mut self,
        label: Option<&str>,
        operands: &[String],
        line_num: u32,
    ) -> LineStatus {
        let Some(label) = label else {
            return self.failure(AsmErrorKind::Directive, "No label found at START", None);
        };
        if operands.len() > 1 {
            return self.failure(AsmErrorKind::Directive, "Invalid operand", None);
        }

        let first = !self.seen_start;
        self.seen_start = true;
        self.in_block = true;
        self.scope = label.to_string();

        let qualified = SymbolTable::qualify(label, label);
        if self.symbols.add_label(&qualified, self.addr, self.file, line_num)
            == SymbolTableResult::Duplicate
        {
            return self.failure(
                AsmErrorKind::Symbol,
                &format!("Label \"{}\" already defined", pretty_name(&qualified)),
                None,
            );
        }

        let entry_name = match operands.first() {
            Some(target) => {
                let target_name = SymbolTable::qualify(label, target);
                // The target label is defined later in the block; register
                // it provisionally and let the real definition patch it.
                self.symbols
                    .add_provisional(&target_name, self.file, line_num);
                target_name
            }
            None => qualified,
        };
        if first {
            self.entry_symbol = Some(entry_name);
        }
        LineStatus::Ok
    }

    fn dir_end(&mut self, label: Option<&str>, operands: &[String], line_num: u32) -> LineStatus {
        if let Some(label) = label {
            return self.failure(
                AsmErrorKind::Directive,
                &format!("Can't use label \"{label}\" at END"),
                None,
            );
        }
        if !operands.is_empty() {
            return self.failure(AsmErrorKind::Directive, "Invalid operand", None);
        }

        while let Some(literal) = self.literals.pop() {
            let pool_addr = self.addr;
            let form = &literal.form[1..];
            if form.starts_with('\'') {
                let Some(bytes) = scanner::decode_quoted(form) else {
                    return self.failure(
                        AsmErrorKind::Directive,
                        &format!("Invalid literal: {}", literal.form),
                        None,
                    );
                };
                for byte in bytes {
                    self.emit_word(byte as u16, line_num);
                }
            } else if let Some(word) = parse_hex_word(form).or_else(|| parse_signed_decimal(form)) {
                self.emit_word(word, line_num);
            } else {
                return self.failure(
                    AsmErrorKind::Directive,
                    &format!("Invalid literal: {}", literal.form),
                    None,
                );
            }
            self.symbols
                .add_literal(&literal.name, pool_addr, self.file, line_num);
        }

        self.in_block = false;
        LineStatus::Ok
    }

    fn dir_ds(&mut self, operands: &[String], line_num: u32) -> LineStatus {
        if operands.len() != 1 {
            return self.failure(AsmErrorKind::Directive, "Invalid operand", None);
        }
        let token = &operands[0];
        let count = match token.parse::<u16>() {
            Ok(count) if token.bytes().all(|b| b.is_ascii_digit()) => count,
            _ => {
                return self.failure(
                    AsmErrorKind::Directive,
                    &format!("\"{token}\" must be decimal"),
                    None,
                )
            }
        };
        for _ in 0..count {
            self.emit_word(0, line_num);
        }
        LineStatus::Ok
    }

    fn dir_dc(&mut self, operands: &[String], line_num: u32) -> LineStatus {
        if operands.is_empty() {
            return self.failure(AsmErrorKind::Directive, "Invalid operand", None);
        }
        for token in operands {
            if token.starts_with('\'') {
                let Some(bytes) = scanner::decode_quoted(token) else {
                    return self.failure(AsmErrorKind::Directive, "Invalid operand", None);
                };
                for byte in bytes {
                    self.emit_word(byte as u16, line_num);
                }
            } else {
                let expr = self.operand_expr(token, false);
                self.emit_expr(&expr, line_num);
            }
        }
        LineStatus::Ok
    }

    /// `IN`/`OUT` expand to the fixed save/load/trap/restore sequence;
    /// only the trap vector differs.
    fn expand_in_out(&mut self, operands: &[String], line_num: u32, vector: &str) -> LineStatus {
        if operands.len() != 2 {
            return self.failure(AsmErrorKind::Directive, "Invalid operand", None);
        }
        let buf = self.operand_expr(&operands[0], false);
        let len = self.operand_expr(&operands[1], false);
        let push = opcode("PUSH") as u16;
        let pop = opcode("POP") as u16;
        let lad = opcode("LAD") as u16;
        let svc = opcode("SVC") as u16;

        self.emit_word(push << 8 | 0x1, line_num); // PUSH 0, GR1
        self.emit_word(0, line_num);
        self.emit_word(push << 8 | 0x2, line_num); // PUSH 0, GR2
        self.emit_word(0, line_num);
        self.emit_word(lad << 8 | 0x10, line_num); // LAD GR1, buf
        self.emit_expr(&buf, line_num);
        self.emit_word(lad << 8 | 0x20, line_num); // LAD GR2, len
        self.emit_expr(&len, line_num);
        self.emit_word(svc << 8, line_num); // SVC vector
        self.emit_expr(vector, line_num);
        self.emit_word(pop << 8 | 0x20, line_num); // POP GR2
        self.emit_word(pop << 8 | 0x10, line_num); // POP GR1
        LineStatus::Ok
    }

    fn expand_rpush(&mut self, line_num: u32) -> LineStatus {
        let push = opcode("PUSH") as u16;
        for reg in 1..=7u16 {
            self.emit_word(push << 8 | reg, line_num);
            self.emit_word(0, line_num);
        }
        LineStatus::Ok
    }

    fn expand_rpop(&mut self, line_num: u32) -> LineStatus {
        let pop = opcode("POP") as u16;
        for reg in (1..=7u16).rev() {
            self.emit_word(pop << 8 | reg << 4, line_num);
        }
        LineStatus::Ok
    }
}

/// `GR0`..`GR7`.
fn parse_register(token: &str) -> Option<u8> {
    let digit = token.strip_prefix("GR")?;
    if digit.len() != 1 {
        return None;
    }
    let value = digit.bytes().next()?;
    if (b'0'..=b'7').contains(&value) {
        Some(value - b'0')
    } else {
        None
    }
}

/// Operand tokens that look like symbols: `[A-Z][A-Za-z0-9]*`.
fn is_identifier(token: &str) -> bool {
    let bytes = token.as_bytes();
    match bytes.first() {
        Some(first) if first.is_ascii_uppercase() => {
            bytes[1..].iter().all(|b| b.is_ascii_alphanumeric())
        }
        _ => false,
    }
}

/// Listing output: one row per emitted word, then the symbol table.
pub struct ListingWriter<W: Write> {
    out: W,
}

impl<W: Write> ListingWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_image(
        &mut self,
        resolved: &ResolvedImage,
        source_lines: &[String],
    ) -> io::Result<()> {
        let mut last_line: Option<u32> = None;
        for cell in &resolved.cells {
            if last_line == Some(cell.line) {
                // Follow-up words of the same source line elide the address.
                writeln!(self.out, "{:4}      {:04x}", cell.line, cell.word)?;
            } else {
                let source = source_lines
                    .get(cell.line.saturating_sub(1) as usize)
                    .map(String::as_str)
                    .unwrap_or("");
                writeln!(
                    self.out,
                    "{:4} {:04x} {:04x}\t{}",
                    cell.line, cell.addr, cell.word, source
                )?;
            }
            last_line = Some(cell.line);
        }
        Ok(())
    }

    pub fn write_symbols(&mut self, symbols: &SymbolTable) -> io::Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, "Defined symbols:")?;
        for entry in symbols.entries_by_line() {
            if entry.is_provisional() {
                continue;
            }
            writeln!(
                self.out,
                "{}:{}:\t{} = #{:04x}",
                entry.file,
                entry.line,
                pretty_name(&entry.name),
                entry.value
            )?;
        }
        Ok(())
    }
}

/// Format an error message with an optional parameter.
pub fn format_error(msg: &str, param: Option<&str>) -> String {
    match param {
        Some(p) => format!("{msg}: {p}"),
        None => msg.to_string(),
    }
}

/// Build source context lines for error display.
pub fn build_context_lines(
    line_num: u32,
    column: Option<usize>,
    lines: Option<&[String]>,
    use_color: bool,
) -> Vec<String> {
    let mut out = Vec::new();
    let line_idx = line_num.saturating_sub(1) as usize;

    let lines = match lines {
        Some(lines) if !lines.is_empty() => lines,
        _ => return out,
    };
    if line_idx >= lines.len() {
        out.push(format!("{:>5} | <source unavailable>", line_num));
        return out;
    }

    let display = highlight_line(&lines[line_idx], column, use_color);
    out.push(format!("{:>5} | {}", line_num, display));
    out
}

fn highlight_line(line: &str, column: Option<usize>, use_color: bool) -> String {
    let col = match column {
        Some(c) if c > 0 => c,
        _ => return line.to_string(),
    };
    let idx = col - 1;
    if idx >= line.len() {
        if use_color {
            return format!("{line}\x1b[31m^\x1b[0m");
        }
        return format!("{line}^");
    }
    let (head, tail) = line.split_at(idx);
    let ch = tail.chars().next().unwrap_or(' ');
    let rest = &tail[ch.len_utf8()..];
    if use_color {
        format!("{head}\x1b[31m{ch}\x1b[0m{rest}")
    } else {
        format!("{head}{ch}{rest}")
    }
}

#[cfg(test)]
mod tests {
    use super::{assemble, input_base_from_path, Assembler, Cli, Diagnostic, ResolvedImage};
    use clap::Parser;
    use std::path::PathBuf;

    fn assemble_ok(source: &str) -> ResolvedImage {
        match assemble(source, "test.cas") {
            Ok(resolved) => resolved,
            Err(diags) => panic!(
                "expected success, got: {:?}",
                diags.iter().map(|d| d.format()).collect::<Vec<_>>()
            ),
        }
    }

    fn assemble_err(source: &str) -> Vec<Diagnostic> {
        match assemble(source, "test.cas") {
            Ok(_) => panic!("expected failure"),
            Err(diags) => diags,
        }
    }

    fn messages(diags: &[Diagnostic]) -> Vec<String> {
        diags.iter().map(|d| d.message().to_string()).collect()
    }

    #[test]
    fn cli_parses_flags_and_input() {
        let cli = Cli::parse_from(["casl2", "-a", "-o", "out", "prog.cas"]);
        assert!(cli.listing);
        assert_eq!(cli.outfile.as_deref(), Some("out"));
        assert_eq!(cli.infile, Some(PathBuf::from("prog.cas")));
    }

    #[test]
    fn input_must_end_with_cas() {
        assert!(input_base_from_path(&PathBuf::from("prog.asm")).is_err());
        let (name, base) = input_base_from_path(&PathBuf::from("dir/prog.cas")).expect("ok");
        assert_eq!(name, "dir/prog.cas");
        assert_eq!(base, "prog");
    }

    #[test]
    fn minimal_program_has_zero_entry_and_ret() {
        let resolved = assemble_ok("MAIN  START\n      RET\n      END\n");
        assert_eq!(resolved.entry, 0);
        assert_eq!(resolved.words, vec![0x8100]);
    }

    #[test]
    fn entry_point_follows_the_start_operand() {
        let resolved = assemble_ok(
            "MAIN  START  GO\nX     DC     1\nGO    RET\n      END\n",
        );
        assert_eq!(resolved.entry, 1);
        assert_eq!(resolved.words, vec![0x0001, 0x8100]);
    }

    #[test]
    fn op1_emits_opcode_then_deferred_address() {
        let resolved = assemble_ok(
            "MAIN  START\n      ST   GR1, X, GR2\n      RET\nX     DS   1\n      END\n",
        );
        assert_eq!(resolved.words, vec![0x1112, 0x0003, 0x8100, 0x0000]);
    }

    #[test]
    fn op5_register_form_is_one_word() {
        let resolved = assemble_ok("MAIN  START\n      ADDA GR1, GR2\n      RET\n      END\n");
        assert_eq!(resolved.words, vec![0x2412, 0x8100]);
    }

    #[test]
    fn op5_memory_form_keeps_base_opcode() {
        let resolved = assemble_ok(
            "MAIN  START\n      ADDA GR1, ONE\n      RET\nONE   DC   1\n      END\n",
        );
        assert_eq!(resolved.words, vec![0x2010, 0x0003, 0x8100, 0x0001]);
    }

    #[test]
    fn gr0_is_rejected_as_index_register() {
        let diags = assemble_err("MAIN  START\n      LD  GR1, X, GR0\n      END\n");
        assert!(messages(&diags).contains(&"Can't use GR0 as an index register".to_string()));

        let diags = assemble_err("MAIN  START\n      LD  GR1, X, 0\n      END\n");
        assert!(messages(&diags).contains(&"Can't use GR0 as an index register".to_string()));
    }

    #[test]
    fn duplicate_label_is_reported() {
        let diags = assemble_err("MAIN  START\nA     DC  1\nA     DC  2\n      END\n");
        assert!(messages(&diags)
            .contains(&"Label \"A in routine MAIN\" already defined".to_string()));
    }

    #[test]
    fn labels_scope_per_start_block() {
        let resolved = assemble_ok(
            "A     START\nL     DC   1\n      END\nB     START\nL     DC   2\n      END\n",
        );
        assert_eq!(resolved.words, vec![0x0001, 0x0002]);
    }

    #[test]
    fn references_resolve_to_the_local_scope() {
        let resolved = assemble_ok(
            "A     START\n      LD   GR1, L\n      RET\nL     DC   7\n      END\n\
             B     START\n      LD   GR1, L\n      RET\nL     DC   9\n      END\n",
        );
        // Block A loads from address 3, block B from address 7.
        assert_eq!(resolved.words[1], 0x0003);
        assert_eq!(resolved.words[5], 0x0007);
        assert_eq!(resolved.words[3], 0x0007);
        assert_eq!(resolved.words[7], 0x0009);
    }

    #[test]
    fn call_falls_back_to_the_routine_entry() {
        let resolved = assemble_ok(
            "MAIN  START\n      CALL SUB\n      RET\n      END\n\
             SUB   START\n      RET\n      END\n",
        );
        assert_eq!(resolved.words, vec![0x8000, 0x0003, 0x8100, 0x8100]);
    }

    #[test]
    fn literal_is_materialised_after_the_code() {
        let resolved = assemble_ok("MAIN  START\n      LD   GR1, =5\n      RET\n      END\n");
        // LD, pool address, RET, then the pool itself.
        assert_eq!(resolved.words, vec![0x1010, 0x0003, 0x8100, 0x0005]);
    }

    #[test]
    fn identical_literals_share_one_pool_entry() {
        let resolved = assemble_ok(
            "MAIN  START\n      LD   GR1, =5\n      LD   GR2, =5\n      RET\n      END\n",
        );
        assert_eq!(
            resolved.words,
            vec![0x1010, 0x0005, 0x1020, 0x0005, 0x8100, 0x0005]
        );
    }

    #[test]
    fn string_literal_fills_one_word_per_byte() {
        let resolved = assemble_ok("MAIN  START\n      LAD  GR1, ='AB'\n      RET\n      END\n");
        assert_eq!(resolved.words, vec![0x1210, 0x0003, 0x8100, 0x0041, 0x0042]);
    }

    #[test]
    fn malformed_literal_is_reported() {
        let diags = assemble_err("MAIN  START\n      LD   GR1, =x\n      RET\n      END\n");
        assert!(messages(&diags).contains(&"Invalid literal: =x".to_string()));
    }

    #[test]
    fn dc_decodes_doubled_quotes() {
        let resolved = assemble_ok("MAIN  START\nS     DC   'ab''c'\n      END\n");
        assert_eq!(resolved.words, vec![0x0061, 0x0027, 0x0063]);
    }

    #[test]
    fn dc_accepts_numbers_and_labels() {
        let resolved = assemble_ok(
            "MAIN  START\nV     DC   -1, #00ff, V\n      END\n",
        );
        assert_eq!(resolved.words, vec![0xffff, 0x00ff, 0x0000]);
    }

    #[test]
    fn ds_reserves_zeroed_words() {
        let resolved = assemble_ok("MAIN  START\nB     DS   3\nE     DC   1\n      END\n");
        assert_eq!(resolved.words, vec![0, 0, 0, 1]);
    }

    #[test]
    fn ds_requires_a_decimal_argument() {
        let diags = assemble_err("MAIN  START\nB     DS   #0010\n      END\n");
        assert!(messages(&diags).contains(&"\"#0010\" must be decimal".to_string()));
    }

    #[test]
    fn in_macro_expands_to_twelve_words() {
        let resolved = assemble_ok(
            "MAIN  START\n      IN   BUF, LEN\n      RET\nBUF   DS   8\nLEN   DS   1\n      END\n",
        );
        assert_eq!(resolved.words.len(), 13 + 9);
        assert_eq!(
            &resolved.words[..12],
            &[
                0x7001, 0x0000, // PUSH 0, GR1
                0x7002, 0x0000, // PUSH 0, GR2
                0x1210, 0x000d, // LAD GR1, BUF
                0x1220, 0x0015, // LAD GR2, LEN
                0xf000, 0xfff0, // SVC #fff0
                0x7120, 0x7110, // POP GR2; POP GR1
            ]
        );
    }

    #[test]
    fn out_macro_uses_the_out_vector() {
        let resolved = assemble_ok(
            "MAIN  START\n      OUT  BUF, LEN\n      RET\nBUF   DS   8\nLEN   DS   1\n      END\n",
        );
        assert_eq!(resolved.words[9], 0xfff2);
    }

    #[test]
    fn rpush_and_rpop_expand_to_fixed_sequences() {
        let resolved = assemble_ok("MAIN  START\n      RPUSH\n      RPOP\n      RET\n      END\n");
        assert_eq!(resolved.words.len(), 14 + 7 + 1);
        assert_eq!(resolved.words[0], 0x7001);
        assert_eq!(resolved.words[12], 0x7007);
        assert_eq!(resolved.words[14], 0x7170); // POP GR7 first
        assert_eq!(resolved.words[20], 0x7110); // POP GR1 last
        assert_eq!(resolved.words[21], 0x8100);
    }

    #[test]
    fn undefined_symbol_is_reported_with_pretty_name() {
        let diags = assemble_err("MAIN  START\n      LD   GR1, NOPE\n      RET\n      END\n");
        assert!(messages(&diags)
            .contains(&"Undefined symbol \"NOPE in routine MAIN\"".to_string()));
    }

    #[test]
    fn instruction_before_start_is_rejected() {
        let diags = assemble_err("      RET\n");
        assert!(messages(&diags).contains(&"No \"START\" instruction found".to_string()));
    }

    #[test]
    fn missing_end_is_rejected() {
        let diags = assemble_err("MAIN  START\n      RET\n");
        assert!(messages(&diags).contains(&"No \"END\" instruction found".to_string()));
    }

    #[test]
    fn start_requires_a_label() {
        let diags = assemble_err("      START\n      RET\n      END\n");
        assert!(messages(&diags).contains(&"No label found at START".to_string()));
    }

    #[test]
    fn end_rejects_a_label() {
        let diags = assemble_err("MAIN  START\n      RET\nX     END\n");
        assert!(messages(&diags).contains(&"Can't use label \"X\" at END".to_string()));
    }

    #[test]
    fn unknown_mnemonic_is_an_illegal_instruction() {
        let diags = assemble_err("MAIN  START\n      MOV  GR1, GR2\n      END\n");
        assert!(messages(&diags).contains(&"Illegal instruction \"MOV\"".to_string()));
    }

    #[test]
    fn syntax_errors_carry_file_and_line() {
        let diags = assemble_err("MAIN  START\n      ld gr1\n      END\n");
        let diag = &diags[0];
        assert_eq!(diag.format(), "test.cas:2: Syntax error");
    }

    #[test]
    fn wrong_arity_is_an_invalid_operand() {
        let diags = assemble_err("MAIN  START\n      LD   GR1\n      END\n");
        assert!(messages(&diags).contains(&"Invalid operand".to_string()));
    }

    #[test]
    fn missing_entry_label_is_reported() {
        let diags = assemble_err("MAIN  START NOWHERE\n      RET\n      END\n");
        assert!(messages(&diags)
            .contains(&"Label \"NOWHERE in routine MAIN\" is not defined".to_string()));
    }

    #[test]
    fn listing_shows_words_and_symbols() {
        let mut assembler = Assembler::new(
            "test.cas",
            "MAIN  START\n      LD   GR1, =5\n      RET\n      END\n",
        );
        let counts = assembler.pass1();
        assert_eq!(counts.errors, 0);
        let resolved = assembler.pass2().expect("pass2");

        let mut out = Vec::new();
        let mut listing = super::ListingWriter::new(&mut out);
        listing
            .write_image(&resolved, assembler.source_lines())
            .expect("image");
        listing.write_symbols(assembler.symbols()).expect("symbols");
        let text = String::from_utf8(out).expect("utf8");

        assert!(text.contains("   2 0000 1010\t      LD   GR1, =5"));
        assert!(text.contains("   2      0003"));
        assert!(text.contains("Defined symbols:"));
        assert!(text.contains("test.cas:1:\tMAIN = #0000"));
        assert!(text.contains("=5 = #0003"));
    }
}
