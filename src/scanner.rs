// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Line scanning for CASL II source.
//!
//! A physical line splits into an optional column-1 label, an uppercase
//! mnemonic, and the remaining operand text. Comments start at a `;` that
//! is outside a single-quoted string; `''` inside a string is an escaped
//! quote.

use std::fmt;

const MAX_LABEL_LEN: usize = 8;

/// One source line reduced to its three fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub label: Option<String>,
    pub mnemonic: String,
    pub operands: String,
}

/// Error raised while splitting a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    Syntax,
    InvalidLabel(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Syntax => write!(f, "Syntax error"),
            ScanError::InvalidLabel(name) => write!(f, "Invalid label \"{name}\""),
        }
    }
}

/// Split one physical line into label, mnemonic, and operand text.
///
/// Returns `Ok(None)` for blank and comment-only lines.
pub fn parse_line(line: &str) -> Result<Option<SourceLine>, ScanError> {
    let code = strip_comment(line);
    let code = code.trim_end();
    if code.trim().is_empty() {
        return Ok(None);
    }

    let bytes = code.as_bytes();
    let mut pos = 0usize;

    let label = if !bytes[0].is_ascii_whitespace() {
        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let name = &code[..pos];
        if !is_valid_label(name) {
            return Err(ScanError::InvalidLabel(name.to_string()));
        }
        Some(name.to_string())
    } else {
        None
    };

    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    let mnemonic_start = pos;
    while pos < bytes.len() && bytes[pos].is_ascii_uppercase() {
        pos += 1;
    }
    if pos == mnemonic_start {
        return Err(ScanError::Syntax);
    }
    if pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
        return Err(ScanError::Syntax);
    }
    let mnemonic = code[mnemonic_start..pos].to_string();

    let operands = code[pos..].trim().to_string();
    Ok(Some(SourceLine {
        label,
        mnemonic,
        operands,
    }))
}

/// Split an operand string at top-level commas.
///
/// Commas inside single-quoted strings do not separate; the `''` escape is
/// preserved verbatim so `'h'',i'` stays one operand.
pub fn split_operands(operands: &str) -> Vec<String> {
    let mut out = Vec::new();
    if operands.trim().is_empty() {
        return out;
    }
    let mut current = String::new();
    let mut in_quote = false;
    for ch in operands.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            ',' if !in_quote => {
                out.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    out.push(current.trim().to_string());
    out
}

/// Labels are 1-8 characters, first uppercase, rest alphanumeric.
pub fn is_valid_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_LABEL_LEN {
        return false;
    }
    if !bytes[0].is_ascii_uppercase() {
        return false;
    }
    bytes[1..].iter().all(|b| b.is_ascii_alphanumeric())
}

/// Decode a quoted string operand (`'…'` with `''` escapes) into its bytes.
///
/// Returns `None` when the quotes do not balance.
pub fn decode_quoted(text: &str) -> Option<Vec<u8>> {
    let bytes = text.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'\'' {
        return None;
    }
    let mut out = Vec::new();
    let mut pos = 1usize;
    loop {
        if pos >= bytes.len() {
            return None;
        }
        if bytes[pos] == b'\'' {
            if pos + 1 < bytes.len() && bytes[pos + 1] == b'\'' {
                out.push(b'\'');
                pos += 2;
                continue;
            }
            // Closing quote must end the operand.
            if pos + 1 != bytes.len() {
                return None;
            }
            return Some(out);
        }
        out.push(bytes[pos]);
        pos += 1;
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            ';' if !in_quote => return &line[..idx],
            _ => {}
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::{decode_quoted, is_valid_label, parse_line, split_operands, ScanError};

    #[test]
    fn parses_label_mnemonic_operands() {
        let line = parse_line("MAIN  START  BEGIN")
            .expect("parse")
            .expect("non-empty");
        assert_eq!(line.label.as_deref(), Some("MAIN"));
        assert_eq!(line.mnemonic, "START");
        assert_eq!(line.operands, "BEGIN");
    }

    #[test]
    fn parses_unlabeled_instruction() {
        let line = parse_line("      LD   GR1, A, GR2")
            .expect("parse")
            .expect("non-empty");
        assert!(line.label.is_none());
        assert_eq!(line.mnemonic, "LD");
        assert_eq!(line.operands, "GR1, A, GR2");
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert_eq!(parse_line("").expect("parse"), None);
        assert_eq!(parse_line("   \t ").expect("parse"), None);
        assert_eq!(parse_line("; whole-line comment").expect("parse"), None);
    }

    #[test]
    fn strips_trailing_comment_outside_quotes() {
        let line = parse_line("  OUT  BUF, LEN  ; echo")
            .expect("parse")
            .expect("line");
        assert_eq!(line.operands, "BUF, LEN");
    }

    #[test]
    fn keeps_semicolon_inside_quoted_string() {
        let line = parse_line("  DC  'a;b' ; real comment")
            .expect("parse")
            .expect("line");
        assert_eq!(line.operands, "'a;b'");
    }

    #[test]
    fn rejects_lowercase_mnemonic() {
        assert_eq!(parse_line("  ld GR1, A"), Err(ScanError::Syntax));
    }

    #[test]
    fn rejects_invalid_labels() {
        assert_eq!(
            parse_line("9LBL  RET"),
            Err(ScanError::InvalidLabel("9LBL".to_string()))
        );
        assert_eq!(
            parse_line("TOOLONG09  RET"),
            Err(ScanError::InvalidLabel("TOOLONG09".to_string()))
        );
        assert!(is_valid_label("A"));
        assert!(is_valid_label("LOOP8x"));
        assert!(!is_valid_label("aLOOP"));
    }

    #[test]
    fn splits_top_level_commas_only() {
        assert_eq!(split_operands("GR1, A, GR2"), vec!["GR1", "A", "GR2"]);
        assert_eq!(split_operands("'h,i', LEN"), vec!["'h,i'", "LEN"]);
        assert_eq!(split_operands(""), Vec::<String>::new());
    }

    #[test]
    fn keeps_doubled_quote_operand_whole() {
        assert_eq!(split_operands("'h'',i'"), vec!["'h'',i'"]);
    }

    #[test]
    fn decodes_quoted_strings() {
        assert_eq!(decode_quoted("'abc'"), Some(b"abc".to_vec()));
        assert_eq!(decode_quoted("'ab''c'"), Some(b"ab'c".to_vec()));
        assert_eq!(decode_quoted("''"), Some(Vec::new()));
        assert_eq!(decode_quoted("'open"), None);
        assert_eq!(decode_quoted("'a'b'"), None);
    }
}
