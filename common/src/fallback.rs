// SPDX-FileCopyrightText: © 2024 Hugues Bruant <hugues.bruant@gmail.com>

//! Regex extraction backend, used when the structural parser is unavailable
//! or fails on a file. Best-effort by design: a blanking pre-pass removes
//! string literals and comments (preserving byte offsets and newlines so
//! line numbers stay faithful), physical lines are joined across backslash
//! continuations and open brackets, and declaration shapes are matched per
//! logical line.

use regex::Regex;
use std::sync::LazyLock;

use crate::parser::{DynamicKind, FromName, ImportRecord};

/// Replace string-literal and comment content with spaces, one space per
/// byte, so every byte offset in the output maps to the same offset in the
/// input. Newlines survive, including inside triple-quoted strings.
fn sanitize_source(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let blank = |out: &mut String, c: char| {
        if c == '\n' {
            out.push('\n');
        } else {
            for _ in 0..c.len_utf8() {
                out.push(' ');
            }
        }
    };

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    blank(&mut out, chars[i]);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let triple = chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote);
                let opener = if triple { 3 } else { 1 };
                for _ in 0..opener {
                    blank(&mut out, quote);
                    i += 1;
                }
                loop {
                    if i >= chars.len() {
                        break;
                    }
                    let c = chars[i];
                    if c == '\\' {
                        blank(&mut out, c);
                        i += 1;
                        if i < chars.len() {
                            blank(&mut out, chars[i]);
                            i += 1;
                        }
                    } else if !triple && (c == quote || c == '\n') {
                        blank(&mut out, c);
                        i += 1;
                        break;
                    } else if triple
                        && c == quote
                        && chars.get(i + 1) == Some(&quote)
                        && chars.get(i + 2) == Some(&quote)
                    {
                        for _ in 0..3 {
                            blank(&mut out, quote);
                            i += 1;
                        }
                        break;
                    } else {
                        blank(&mut out, c);
                        i += 1;
                    }
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

struct LogicalLine {
    line: u32,
    blanked: String,
    original: String,
}

fn bracket_delta(blanked: &str) -> i32 {
    let mut depth = 0;
    for c in blanked.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
    }
    depth
}

/// Join physical lines into logical ones: backslash continuations and open
/// brackets extend the current line. Both the blanked and the original text
/// are joined with identical edits so byte offsets stay aligned.
fn logical_lines(blanked: &str, original: &str) -> Vec<LogicalLine> {
    let b_lines: Vec<&str> = blanked.split('\n').collect();
    let o_lines: Vec<&str> = original.split('\n').collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < b_lines.len() {
        let start = i;
        let mut b = String::new();
        let mut o = String::new();
        let mut depth: i32 = 0;
        loop {
            let mut bl = b_lines[i].to_string();
            let mut ol = o_lines[i].to_string();
            let continued = bl.trim_end().ends_with('\\');
            if continued {
                let pos = bl.rfind('\\').unwrap();
                bl.replace_range(pos..pos + 1, " ");
                ol.replace_range(pos..pos + 1, " ");
            }
            depth += bracket_delta(&bl);
            b.push_str(&bl);
            o.push_str(&ol);
            if (continued || depth > 0) && i + 1 < b_lines.len() {
                b.push(' ');
                o.push(' ');
                i += 1;
            } else {
                break;
            }
        }
        out.push(LogicalLine {
            line: (start + 1) as u32,
            blanked: b,
            original: o,
        });
        i += 1;
    }
    out
}

static PLAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*import\s+(.+?)\s*$").unwrap());
static FROM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*from\s+(\.*)([A-Za-z_][\w.]*)?\s+import\s+(.+?)\s*$").unwrap());
static MODULE_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][\w.]*)(?:\s+as\s+([A-Za-z_]\w*))?$").unwrap()
});
static NAME_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_]\w*)(?:\s+as\s+([A-Za-z_]\w*))?$").unwrap());
static DYN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:importlib\s*\.\s*|runpy\s*\.\s*|builtins\s*\.\s*)?(import_module|__import__|run_module|run_path)\s*\(",
    )
    .unwrap()
});
static FIRST_KWARG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:name|mod_name|path_name)\s*=\s*").unwrap());
static PACKAGE_KWARG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bpackage\s*=\s*").unwrap());

fn parse_plain(clause: &str, line: u32, records: &mut Vec<ImportRecord>) {
    for item in clause.split(',') {
        let item = item.trim();
        if let Some(caps) = MODULE_ITEM_RE.captures(item) {
            records.push(ImportRecord::Plain {
                module: caps[1].to_string(),
                alias: caps.get(2).map(|m| m.as_str().to_string()),
                line,
            });
        }
    }
}

fn parse_from(dots: &str, base: &str, clause: &str, line: u32, records: &mut Vec<ImportRecord>) {
    let mut clause = clause.trim();
    if let Some(stripped) = clause.strip_prefix('(') {
        clause = stripped.strip_suffix(')').unwrap_or(stripped).trim();
    }
    let mut names = Vec::new();
    for item in clause.split(',') {
        let item = item.trim();
        if item == "*" {
            names.push(FromName::plain("*"));
        } else if let Some(caps) = NAME_ITEM_RE.captures(item) {
            names.push(FromName {
                name: caps[1].to_string(),
                alias: caps.get(2).map(|m| m.as_str().to_string()),
            });
        }
    }
    if names.is_empty() {
        return;
    }
    records.push(ImportRecord::From {
        base: base.to_string(),
        level: dots.len() as u32,
        names,
        line,
    });
}

/// Parse a Python string literal starting at `text`. Returns the value and
/// the byte length consumed, or None when the token is not a plain (or raw)
/// string literal — f-strings and bytes count as non-literal here.
fn parse_string_literal(text: &str) -> Option<(String, usize)> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut raw = false;
    while i < chars.len() && chars[i].is_ascii_alphabetic() {
        match chars[i].to_ascii_lowercase() {
            'r' => raw = true,
            'u' => {}
            _ => return None,
        }
        i += 1;
        if i > 2 {
            return None;
        }
    }
    if i >= chars.len() || (chars[i] != '\'' && chars[i] != '"') {
        return None;
    }
    let quote = chars[i];
    let triple = chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote);
    i += if triple { 3 } else { 1 };
    let mut value = String::new();
    let consumed_bytes = |n: usize| chars[..n].iter().map(|c| c.len_utf8()).sum::<usize>();
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && !raw {
            i += 1;
            if i < chars.len() {
                match chars[i] {
                    '\\' => value.push('\\'),
                    '\'' => value.push('\''),
                    '"' => value.push('"'),
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
                i += 1;
            }
        } else if !triple && c == quote {
            i += 1;
            return Some((value, consumed_bytes(i)));
        } else if triple
            && c == quote
            && chars.get(i + 1) == Some(&quote)
            && chars.get(i + 2) == Some(&quote)
        {
            i += 3;
            return Some((value, consumed_bytes(i)));
        } else if !triple && c == '\n' {
            return None;
        } else {
            value.push(c);
            i += 1;
        }
    }
    None
}

fn dynamic_kind(callee: &str) -> DynamicKind {
    match callee {
        "__import__" => DynamicKind::BuiltinImport,
        "import_module" => DynamicKind::ImportlibImportModule,
        "run_module" => DynamicKind::RunpyRunModule,
        _ => DynamicKind::RunpyRunPath,
    }
}

/// Span of the argument list, and of the first argument within it, using the
/// blanked text for structure (no bracket or comma can hide in a string).
fn argument_spans(blanked: &str, open: usize) -> (usize, usize) {
    let bytes = blanked.as_bytes();
    let mut depth = 1;
    let mut first_end = None;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            b',' if depth == 1 => {
                first_end.get_or_insert(i);
            }
            _ => {}
        }
        i += 1;
    }
    let close = i.min(bytes.len());
    (close, first_end.unwrap_or(close))
}

fn parse_dynamic(
    blanked: &str,
    original: &str,
    line: u32,
    records: &mut Vec<ImportRecord>,
) {
    for caps in DYN_RE.captures_iter(blanked) {
        let whole = caps.get(0).unwrap();
        let before = blanked[..whole.start()].trim_end();
        // skip definitions of same-named functions and attribute calls on
        // owners other than the recognized modules
        if before.ends_with("def") || before.ends_with('.') {
            continue;
        }
        let kind = dynamic_kind(&caps[1]);
        let open = whole.end();
        let (close, first_end) = argument_spans(blanked, open);
        let first_blanked = &blanked[open..first_end];
        if first_blanked.trim().is_empty() {
            continue;
        }
        let kw_skip = FIRST_KWARG_RE
            .find(first_blanked)
            .map(|m| m.end())
            .unwrap_or_else(|| first_blanked.len() - first_blanked.trim_start().len());
        let arg_start = open + kw_skip;

        let mut module = None;
        let mut path = None;
        let mut level = 0;
        let mut expression = None;
        match parse_string_literal(&original[arg_start..first_end]) {
            Some((value, _)) => {
                if kind == DynamicKind::RunpyRunPath {
                    path = Some(value);
                } else {
                    let stripped = value.trim_start_matches('.');
                    level = (value.len() - stripped.len()) as u32;
                    if stripped.is_empty() && level == 0 {
                        continue;
                    }
                    module = Some(stripped.to_string());
                }
            }
            None => {
                expression = Some(original[arg_start..first_end].trim().to_string());
            }
        }

        let mut package = None;
        if kind == DynamicKind::ImportlibImportModule {
            if let Some(m) = PACKAGE_KWARG_RE.find(&blanked[open..close]) {
                if let Some((value, _)) = parse_string_literal(&original[open + m.end()..close]) {
                    package = Some(value);
                }
            }
        }

        records.push(ImportRecord::Dynamic {
            kind,
            module,
            package,
            level,
            path,
            expression,
            line,
        });
    }
}

/// Scan source text for import declarations. Returns records ordered by
/// line; unrecognizable regions are silently skipped.
pub fn scan_source(source: &str) -> Vec<ImportRecord> {
    let blanked = sanitize_source(source);
    let mut records = Vec::new();
    for logical in logical_lines(&blanked, source) {
        // a physical line may hold several statements
        for stmt in logical.blanked.split(';') {
            if let Some(caps) = FROM_RE.captures(stmt) {
                let dots = &caps[1];
                let base = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                if !dots.is_empty() || !base.is_empty() {
                    parse_from(dots, base, &caps[3], logical.line, &mut records);
                }
            } else if let Some(caps) = PLAIN_RE.captures(stmt) {
                parse_plain(&caps[1], logical.line, &mut records);
            }
        }
        parse_dynamic(&logical.blanked, &logical.original, logical.line, &mut records);
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(module: &str, line: u32) -> ImportRecord {
        ImportRecord::Plain {
            module: module.to_string(),
            alias: None,
            line,
        }
    }

    #[test]
    fn plain_imports() {
        let records = scan_source("import os\nimport a.b.c, x as y\n");
        assert_eq!(
            records,
            vec![
                plain("os", 1),
                plain("a.b.c", 2),
                ImportRecord::Plain {
                    module: "x".to_string(),
                    alias: Some("y".to_string()),
                    line: 2,
                },
            ]
        );
    }

    #[test]
    fn from_imports_with_levels() {
        let records = scan_source("from pkg.sub import a, b as c\nfrom .. import x\nfrom .sib import y\n");
        assert_eq!(
            records,
            vec![
                ImportRecord::From {
                    base: "pkg.sub".to_string(),
                    level: 0,
                    names: vec![
                        FromName::plain("a"),
                        FromName {
                            name: "b".to_string(),
                            alias: Some("c".to_string()),
                        },
                    ],
                    line: 1,
                },
                ImportRecord::From {
                    base: String::new(),
                    level: 2,
                    names: vec![FromName::plain("x")],
                    line: 2,
                },
                ImportRecord::From {
                    base: "sib".to_string(),
                    level: 1,
                    names: vec![FromName::plain("y")],
                    line: 3,
                },
            ]
        );
    }

    #[test]
    fn parenthesized_and_continued_lines() {
        let src = "from pkg import (\n    a,\n    b,\n)\nimport one, \\\n    two\n";
        let records = scan_source(src);
        assert_eq!(
            records,
            vec![
                ImportRecord::From {
                    base: "pkg".to_string(),
                    level: 0,
                    names: vec![FromName::plain("a"), FromName::plain("b")],
                    line: 1,
                },
                plain("one", 5),
                plain("two", 5),
            ]
        );
    }

    #[test]
    fn wildcard_sentinel() {
        let records = scan_source("from pkg import *\n");
        match &records[0] {
            ImportRecord::From { names, .. } => {
                assert_eq!(names.len(), 1);
                assert!(names[0].is_wildcard());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn strings_and_comments_are_blind_spots() {
        let src = "# import fake\ns = \"import nope\"\nd = '''\nimport nada\n'''\nimport real\n";
        assert_eq!(scan_source(src), vec![plain("real", 6)]);
    }

    #[test]
    fn line_numbers_survive_multiline_strings() {
        let src = "x = \"\"\"\ntext\nmore\n\"\"\"\nimport late\n";
        assert_eq!(scan_source(src), vec![plain("late", 5)]);
    }

    #[test]
    fn indented_branches_are_all_reported() {
        let src = "try:\n    import fast\nexcept ImportError:\n    import slow\n";
        assert_eq!(scan_source(src), vec![plain("fast", 2), plain("slow", 4)]);
    }

    #[test]
    fn dynamic_literal_calls() {
        let src = "import importlib\nimportlib.import_module(\"plugin\")\n__import__('pkg.mod')\n";
        let records = scan_source(src);
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[1],
            ImportRecord::Dynamic {
                kind: DynamicKind::ImportlibImportModule,
                module: Some("plugin".to_string()),
                package: None,
                level: 0,
                path: None,
                expression: None,
                line: 2,
            }
        );
        assert_eq!(
            records[2],
            ImportRecord::Dynamic {
                kind: DynamicKind::BuiltinImport,
                module: Some("pkg.mod".to_string()),
                package: None,
                level: 0,
                path: None,
                expression: None,
                line: 3,
            }
        );
    }

    #[test]
    fn dynamic_keyword_aliases_and_package() {
        let src = "run_module(mod_name=\"tool\")\nimport_module(\"..rel\", package=\"pkg.sub\")\nrun_path(path_name='scripts/job.py')\n";
        let records = scan_source(src);
        assert_eq!(
            records[0],
            ImportRecord::Dynamic {
                kind: DynamicKind::RunpyRunModule,
                module: Some("tool".to_string()),
                package: None,
                level: 0,
                path: None,
                expression: None,
                line: 1,
            }
        );
        assert_eq!(
            records[1],
            ImportRecord::Dynamic {
                kind: DynamicKind::ImportlibImportModule,
                module: Some("rel".to_string()),
                package: Some("pkg.sub".to_string()),
                level: 2,
                path: None,
                expression: None,
                line: 2,
            }
        );
        assert_eq!(
            records[2],
            ImportRecord::Dynamic {
                kind: DynamicKind::RunpyRunPath,
                module: None,
                package: None,
                level: 0,
                path: Some("scripts/job.py".to_string()),
                expression: None,
                line: 3,
            }
        );
    }

    #[test]
    fn dynamic_non_literal_keeps_expression() {
        let records = scan_source("importlib.import_module(name_var)\n");
        assert_eq!(
            records,
            vec![ImportRecord::Dynamic {
                kind: DynamicKind::ImportlibImportModule,
                module: None,
                package: None,
                level: 0,
                path: None,
                expression: Some("name_var".to_string()),
                line: 1,
            }]
        );
    }

    #[test]
    fn sanitize_preserves_byte_offsets() {
        let src = "x = \"héllo\" # commént\nimport os\n";
        let blanked = sanitize_source(src);
        assert_eq!(blanked.len(), src.len());
        assert_eq!(blanked.matches('\n').count(), src.matches('\n').count());
        assert_eq!(&blanked[src.find("import").unwrap()..src.find("import").unwrap() + 6], "import");
    }
}
