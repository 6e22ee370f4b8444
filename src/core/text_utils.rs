// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Shared text utilities for tokenization, macro expansion, and diagnostics.

/// Check if a byte can start an identifier.
///
/// Besides letters and underscore, `@` (module-local names) and the backtick
/// (temporary names) are accepted.
#[inline]
pub fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'@' || c == b'`'
}

/// Check if a byte is a valid identifier continuation character.
///
/// Dots are accepted so compound names (`module.symbol`) stay one token.
#[inline]
pub fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'@' || c == b'.'
}

/// Check if a byte is whitespace (space or tab).
#[inline]
pub fn is_space(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

/// Split a line into code and comment parts at the first unquoted `;` or `//`.
pub fn split_comment(line: &str) -> (&str, &str) {
    let bytes = line.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut escape = false;
    let mut idx = 0usize;
    while idx < bytes.len() {
        let c = bytes[idx];
        match c {
            _ if escape => {
                escape = false;
            }
            b'\\' if in_single || in_double => {
                escape = true;
            }
            b'\'' if !in_double => {
                in_single = !in_single;
            }
            b'"' if !in_single => {
                in_double = !in_double;
            }
            b';' if !in_single && !in_double => {
                return (&line[..idx], &line[idx..]);
            }
            b'/' if !in_single && !in_double && bytes.get(idx + 1) == Some(&b'/') => {
                return (&line[..idx], &line[idx..]);
            }
            _ => {}
        }
        idx += 1;
    }
    (line, "")
}

/// A simple cursor for scanning text byte-by-byte.
pub struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a new cursor at the start of the input.
    pub fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos.min(self.bytes.len());
    }

    /// Skip spaces and tabs.
    pub fn skip_ws(&mut self) {
        while self.peek().is_some_and(is_space) {
            self.pos += 1;
        }
    }

    /// Peek at the current byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Consume `text` if the input continues with it.
    pub fn eat(&mut self, text: &str) -> bool {
        if self.bytes[self.pos..].starts_with(text.as_bytes()) {
            self.pos += text.len();
            true
        } else {
            false
        }
    }

    /// Consume and return the current byte.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    /// Try to consume an identifier, returning it if found.
    pub fn take_ident(&mut self) -> Option<String> {
        let start = self.pos;
        let first = self.peek()?;
        if !is_ident_start(first) {
            return None;
        }
        self.pos += 1;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        Some(String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string())
    }
}

/// Find every `{{name}}` reference in `text`, in order of appearance.
pub fn find_macro_params(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    scan_macro_params(text, |name| {
        found.push(name.to_string());
        None
    });
    found
}

/// Replace every `{{name}}` reference using `lookup`.
///
/// References the lookup does not know are kept verbatim.
pub fn replace_macro_params<F>(text: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    scan_macro_params(text, |name| lookup(name))
}

fn scan_macro_params<F>(text: &str, mut on_param: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut cursor = Cursor::new(text);
    let mut copied = 0usize;
    while cursor.pos() < text.len() {
        let start = cursor.pos();
        if !cursor.eat("{{") {
            cursor.next();
            continue;
        }
        cursor.skip_ws();
        let Some(name) = cursor.take_ident() else {
            continue;
        };
        cursor.skip_ws();
        if !cursor.eat("}}") {
            continue;
        }
        if let Some(replacement) = on_param(&name) {
            out.push_str(&text[copied..start]);
            out.push_str(&replacement);
            copied = cursor.pos();
        }
    }
    out.push_str(&text[copied..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_start_accepts_temporary_and_local_markers() {
        assert!(is_ident_start(b'a'));
        assert!(is_ident_start(b'_'));
        assert!(is_ident_start(b'`'));
        assert!(is_ident_start(b'@'));
        assert!(!is_ident_start(b'0'));
        assert!(!is_ident_start(b'.'));
    }

    #[test]
    fn split_comment_handles_both_styles() {
        assert_eq!(split_comment("ld a,b ; comment"), ("ld a,b ", "; comment"));
        assert_eq!(split_comment("nop // c"), ("nop ", "// c"));
        assert_eq!(split_comment("no comment"), ("no comment", ""));
        assert_eq!(
            split_comment("\"str;ing\" ; comment"),
            ("\"str;ing\" ", "; comment")
        );
    }

    #[test]
    fn finds_macro_params_with_spaces() {
        let params = find_macro_params("ld {{ reg }},{{value}}");
        assert_eq!(params, vec!["reg".to_string(), "value".to_string()]);
    }

    #[test]
    fn replaces_known_params_only() {
        let text = replace_macro_params("ld {{reg}},{{other}}", |name| {
            (name == "reg").then(|| "a".to_string())
        });
        assert_eq!(text, "ld a,{{other}}");
    }
}
