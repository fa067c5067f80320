use bench_core::Scalar;
use std::collections::BTreeMap;

const READONLY_PREFIX: &str = "readonly ";

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedConfig {
    pub text: String,
    /// Host placeholder keys left untouched because the host list ran out.
    pub unassigned_placeholders: Vec<String>,
    /// Hosts that had no placeholder to go to.
    pub unused_hosts: Vec<String>,
    /// Override keys that matched at least one assignment line.
    pub applied_overrides: Vec<String>,
}

struct Assignment<'a> {
    readonly: bool,
    key: &'a str,
    value: &'a str,
}

fn parse_assignment(line: &str) -> Option<Assignment<'_>> {
    let (readonly, rest) = match line.strip_prefix(READONLY_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let (key, value) = rest.split_once('=')?;
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some(Assignment {
        readonly,
        key,
        value,
    })
}

fn is_host_placeholder(key: &str) -> bool {
    let stem = match key.strip_suffix("_HOSTS").or_else(|| key.strip_suffix("_HOST")) {
        Some(stem) => stem,
        None => return false,
    };
    !stem.is_empty() && stem.chars().all(|c| c.is_ascii_uppercase() || c == '_')
}

fn unquote(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}

fn write_assignment(out: &mut String, readonly: bool, key: &str, literal: &str) {
    if readonly {
        out.push_str(READONLY_PREFIX);
    }
    out.push_str(key);
    out.push('=');
    out.push_str(literal);
}

/// Assigns hosts to `*_HOST`/`*_HOSTS` placeholders in document order and
/// replaces the value of every assignment whose key has an override. Keys the
/// template does not declare are ignored.
pub fn render_config(
    template: &str,
    hosts: &[String],
    overrides: &BTreeMap<String, Scalar>,
) -> RenderedConfig {
    let mut text = String::with_capacity(template.len());
    let mut next_host = hosts.iter();
    let mut unassigned = Vec::new();
    let mut applied = Vec::new();

    for raw_line in template.split_inclusive('\n') {
        let body = raw_line.trim_end_matches(|c: char| c == '\n' || c == '\r');
        let ending = &raw_line[body.len()..];
        let Some(assignment) = parse_assignment(body) else {
            text.push_str(raw_line);
            continue;
        };

        let mut literal: Option<String> = None;
        if is_host_placeholder(assignment.key) {
            match next_host.next() {
                Some(host) => literal = Some(format!("\"{}\"", host)),
                None => unassigned.push(assignment.key.to_string()),
            }
        }
        if let Some(value) = overrides.get(assignment.key) {
            literal = Some(value.shell_literal());
            if !applied.iter().any(|k| k == assignment.key) {
                applied.push(assignment.key.to_string());
            }
        }

        match literal {
            Some(literal) => {
                write_assignment(&mut text, assignment.readonly, assignment.key, &literal);
                text.push_str(ending);
            }
            None => text.push_str(raw_line),
        }
    }

    RenderedConfig {
        text,
        unassigned_placeholders: unassigned,
        unused_hosts: next_host.cloned().collect(),
        applied_overrides: applied,
    }
}

/// Reads back every `KEY=value` line, dropping a leading `readonly` and
/// surrounding double quotes. Later assignments win.
pub fn parse_assignments(document: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in document.lines() {
        if let Some(assignment) = parse_assignment(line.trim_end_matches('\r')) {
            out.insert(
                assignment.key.to_string(),
                unquote(assignment.value).to_string(),
            );
        }
    }
    out
}
