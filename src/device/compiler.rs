//! Runtime compiler of the simulated device.
//!
//! The compiler does not generate code. It checks that the program is well-formed, finds the
//! kernel definitions in it and links each requested entry point to the host routine supplied
//! with the program.
use std::fmt::Write;

use rustc_hash::FxHashMap;

use crate::device::{Kernel, Module, ProgramSource};

/// A kernel definition found in the source text, with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Definition {
    name: String,
    line: usize,
}

/// Compiles the program, returning the module or the build log.
pub(crate) fn compile(program: ProgramSource) -> Result<Module, String> {
    let mut log = String::new();
    let text = strip_comments(&program.text);
    let mut failed = false;

    let _ = writeln!(log, "compiling `{}`", program.name);
    for (name, value) in &program.defines {
        let _ = writeln!(log, "  -D{name}={value}");
    }

    if let Err(message) = check_delimiters(&text) {
        let _ = writeln!(log, "{}: error: {}", program.name, message);
        failed = true;
    }

    let definitions = find_definitions(&text);
    let mut kernels = FxHashMap::default();
    for (entry, routine) in program.entry_points {
        match definitions.iter().find(|def| def.name == entry) {
            Some(def) => {
                let _ = writeln!(log, "{}:{}: linked entry point `{}`", program.name, def.line, entry);
                kernels.insert(
                    entry.clone(),
                    Kernel {
                        name: entry,
                        routine,
                    },
                );
            }
            None => {
                let _ = writeln!(log, "{}: error: entry point `{}` is not defined", program.name, entry);
                failed = true;
            }
        }
    }

    if failed {
        Err(log)
    } else {
        Ok(Module {
            name: program.name,
            kernels,
            build_log: log,
        })
    }
}

/// Replaces comments with whitespace, keeping line structure intact.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut previous = ' ';
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                    }
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn check_delimiters(text: &str) -> Result<(), String> {
    let mut stack = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        for c in line.chars() {
            match c {
                '{' | '(' | '[' => stack.push((c, line_idx + 1)),
                '}' | ')' | ']' => {
                    let expected = match c {
                        '}' => '{',
                        ')' => '(',
                        _ => '[',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, open_line)) => {
                            return Err(format!(
                                "line {}: `{}` does not match `{}` opened on line {}",
                                line_idx + 1,
                                c,
                                open,
                                open_line
                            ))
                        }
                        None => return Err(format!("line {}: unmatched `{}`", line_idx + 1, c)),
                    }
                }
                _ => {}
            }
        }
    }
    match stack.last() {
        Some((open, line)) => Err(format!("`{open}` opened on line {line} is never closed")),
        None => Ok(()),
    }
}

/// Finds `__global__ void name(` and `CEED_QFUNCTION(name)` definitions.
fn find_definitions(text: &str) -> Vec<Definition> {
    let mut definitions = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        let line_no = line_idx + 1;
        if let Some(rest) = after_token(line, "__global__") {
            let rest = rest.trim_start();
            if let Some(rest) = rest.strip_prefix("void") {
                if let Some(name) = leading_identifier(rest.trim_start()) {
                    if rest.trim_start()[name.len()..].trim_start().starts_with('(') {
                        definitions.push(Definition {
                            name: name.to_string(),
                            line: line_no,
                        });
                    }
                }
            }
        }
        if let Some(rest) = after_token(line, "CEED_QFUNCTION") {
            if let Some(rest) = rest.trim_start().strip_prefix('(') {
                if let Some(name) = leading_identifier(rest.trim_start()) {
                    definitions.push(Definition {
                        name: name.to_string(),
                        line: line_no,
                    });
                }
            }
        }
    }
    definitions
}

fn after_token<'a>(line: &'a str, token: &str) -> Option<&'a str> {
    let start = line.find(token)?;
    let before_ok = line[..start]
        .chars()
        .next_back()
        .map_or(true, |c| !is_identifier_char(c));
    let rest = &line[start + token.len()..];
    let after_ok = rest.chars().next().map_or(true, |c| !is_identifier_char(c));
    (before_ok && after_ok).then_some(rest)
}

fn leading_identifier(text: &str) -> Option<&str> {
    let end = text
        .char_indices()
        .find(|(_, c)| !is_identifier_char(*c))
        .map_or(text.len(), |(idx, _)| idx);
    let ident = &text[..end];
    match ident.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => Some(ident),
        _ => None,
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
