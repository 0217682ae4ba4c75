//! Structural pre-flight checks run before a job ever touches a session.
//!
//! Only hard errors reject a shader; warnings are advisory and returned so
//! callers can show them next to the render.
use renderer::program::declares_contract_uniform;
use serde::Serialize;

/// Sources above this size are rejected outright.
pub const MAX_SOURCE_BYTES: usize = 64 * 1024;

const ENTRY_POINT: &str = "mainImage";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn validate(source: &str) -> ValidationReport {
    let mut report = ValidationReport::default();

    if source.trim().is_empty() {
        report.errors.push("shader source is empty".to_string());
        return report;
    }
    if source.len() > MAX_SOURCE_BYTES {
        report.errors.push(format!(
            "shader source is {} bytes; the limit is {} bytes",
            source.len(),
            MAX_SOURCE_BYTES
        ));
    }

    let code = strip_comments(source);
    match output_parameter(&code) {
        None => report.errors.push(format!(
            "missing entry point `void {ENTRY_POINT}(out vec4 fragColor, in vec2 fragCoord)`"
        )),
        Some(Some(name)) if !writes_to(&code, &name) => report
            .warnings
            .push(format!("`{ENTRY_POINT}` never writes its output `{name}`")),
        Some(_) => {}
    }

    for (index, line) in code.lines().enumerate() {
        let trimmed = line.trim_start();
        let line_no = index + 1;
        if trimmed.starts_with("#version") {
            report.warnings.push(format!(
                "line {line_no}: `#version` is ignored; the program template sets its own"
            ));
        }
        if declares_contract_uniform(trimmed) {
            report.warnings.push(format!(
                "line {line_no}: built-in uniform re-declared; the declaration is dropped"
            ));
        }
    }

    if contains_identifier(&code, "gl_FragColor") {
        report
            .warnings
            .push("`gl_FragColor` is not available; write to the `mainImage` output".to_string());
    }
    if contains_identifier(&code, "texture2D") {
        report
            .warnings
            .push("`texture2D` is legacy GLSL; use `texture`".to_string());
    }

    report
}

/// Replaces comments with whitespace so line numbers survive.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        match (ch, chars.peek()) {
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                    }
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                out.push(' ');
            }
            _ => out.push(ch),
        }
    }
    out
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// Finds whole-word occurrences of `word` and yields the byte offset after each.
fn identifier_ends<'a>(code: &'a str, word: &'a str) -> impl Iterator<Item = usize> + 'a {
    code.match_indices(word).filter_map(move |(start, _)| {
        let end = start + word.len();
        let before = code[..start].chars().next_back();
        let after = code[end..].chars().next();
        let bounded = !before.is_some_and(is_ident_char) && !after.is_some_and(is_ident_char);
        bounded.then_some(end)
    })
}

fn contains_identifier(code: &str, word: &str) -> bool {
    identifier_ends(code, word).next().is_some()
}

/// `None` when no `void mainImage(` definition exists; otherwise the name of
/// its first `out vec4` parameter when one can be read.
fn output_parameter(code: &str) -> Option<Option<String>> {
    let after_name = identifier_ends(code, ENTRY_POINT).find(|&end| {
        let before = code[..end - ENTRY_POINT.len()].trim_end();
        before.ends_with("void") && code[end..].trim_start().starts_with('(')
    })?;
    let params_start = after_name + code[after_name..].find('(')? + 1;
    let params_end = params_start + code[params_start..].find(')')?;
    let first = code[params_start..params_end].split(',').next()?;
    let tokens: Vec<&str> = first.split_whitespace().collect();
    let name = match tokens.as_slice() {
        ["out", "vec4", name] | ["out", "highp", "vec4", name] | ["out", "mediump", "vec4", name] => {
            Some(name.to_string())
        }
        _ => None,
    };
    Some(name)
}

/// True if `name` (optionally swizzled) appears on the left of an assignment.
fn writes_to(code: &str, name: &str) -> bool {
    identifier_ends(code, name).any(|end| {
        let rest = code[end..].trim_start();
        let rest = match rest.strip_prefix('.') {
            Some(swizzle) => swizzle.trim_start_matches(is_ident_char).trim_start(),
            None => rest,
        };
        let assigns = ["=", "+=", "-=", "*=", "/="]
            .iter()
            .any(|op| rest.starts_with(op));
        assigns && !rest.starts_with("==")
    })
}
