//! Line-level edits of the generated server configuration.
//!
//! The file is owned by the server binary; only the lines being overridden
//! are rewritten and everything else (comments, key order, unknown fields)
//! passes through untouched.

use crate::errors::DeployError;

/// Read the value of `key` directly under the top-level `section`
pub fn get_section_value(text: &str, section: &str, key: &str) -> Option<String> {
    let mut walker = SectionWalker::new(section);
    for line in text.lines() {
        if walker.is_direct_child(line) {
            if let Some(value) = value_of(line, key) {
                return Some(value);
            }
        }
    }
    None
}

/// Set `key` directly under the top-level `section` to `value`.
///
/// The first matching line is rewritten in place keeping its indentation and
/// trailing comment; a missing key is inserted right after the section
/// header. A missing section is an error.
pub fn set_section_value(text: &str, section: &str, key: &str, value: &str) -> Result<String, DeployError> {
    let mut walker = SectionWalker::new(section);
    let mut out = String::with_capacity(text.len() + 32);
    let mut header_end = None;
    let mut replaced = false;

    for line in text.split_inclusive('\n') {
        let (body, eol) = split_eol(line);
        let direct_child = walker.is_direct_child(body);
        if walker.at_header && header_end.is_none() {
            header_end = Some(out.len() + line.len());
        }

        if direct_child && !replaced && value_of(body, key).is_some() {
            let indent = &body[..body.len() - body.trim_start().len()];
            let comment = trailing_comment(body);
            out.push_str(&format!("{}{}: {}{}{}", indent, key, yaml_scalar(value), comment, eol));
            replaced = true;
        } else {
            out.push_str(line);
        }
    }

    if replaced {
        return Ok(out);
    }

    let Some(insert_at) = header_end else {
        return Err(DeployError::ConfigurationError(format!(
            "Section '{}' not found in generated configuration",
            section
        )));
    };
    let indent = " ".repeat(walker.child_indent.unwrap_or(2));
    let mut inserted = String::new();
    if !out[..insert_at].ends_with('\n') {
        inserted.push('\n');
    }
    inserted.push_str(&format!("{}{}: {}\n", indent, key, yaml_scalar(value)));
    out.insert_str(insert_at, &inserted);
    Ok(out)
}

/// Rewrite `:<old_port>` to `:<new_port>` in the list items of
/// `section.key`, e.g. `Client.server_urls`.
pub fn replace_list_port(text: &str, section: &str, key: &str, old_port: u16, new_port: u16) -> String {
    let mut walker = SectionWalker::new(section);
    let mut in_list = false;
    let mut list_indent = 0;
    let old = format!(":{}", old_port);
    let new = format!(":{}", new_port);

    text.split_inclusive('\n')
        .map(|line| {
            let (body, _) = split_eol(line);
            let direct_child = walker.is_direct_child(body);
            if direct_child {
                in_list = value_of(body, key).is_some_and(|v| v.is_empty());
                list_indent = indent_of(body);
                return line.to_string();
            }
            let item = body.trim_start();
            if in_list && walker.in_section && item.starts_with("- ") && indent_of(body) >= list_indent {
                return replace_port_token(line, &old, &new);
            }
            if !body.trim().is_empty() {
                in_list = false;
            }
            line.to_string()
        })
        .collect()
}

/// Quote a value when a plain YAML scalar would be misread
pub fn yaml_scalar(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.contains(": ")
        || value.contains(" #")
        || value.ends_with(':')
        || value.starts_with(|c: char| "!&*{}[]|>'\"%@`#,?-".contains(c) || c.is_whitespace())
        || value.ends_with(char::is_whitespace);
    if needs_quotes {
        format!("'{}'", value.replace('\'', "''"))
    } else {
        value.to_string()
    }
}

/// Tracks whether the current line sits directly inside a top-level section
struct SectionWalker<'a> {
    section: &'a str,
    in_section: bool,
    at_header: bool,
    child_indent: Option<usize>,
}

impl<'a> SectionWalker<'a> {
    fn new(section: &'a str) -> Self {
        Self {
            section,
            in_section: false,
            at_header: false,
            child_indent: None,
        }
    }

    fn is_direct_child(&mut self, line: &str) -> bool {
        self.at_header = false;
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return false;
        }

        let indent = indent_of(line);
        if indent == 0 && !trimmed.starts_with('-') {
            self.in_section = value_of(line, self.section).is_some_and(|v| v.is_empty());
            self.at_header = self.in_section;
            return false;
        }

        if !self.in_section {
            return false;
        }
        let child_indent = *self.child_indent.get_or_insert(indent);
        indent == child_indent && !trimmed.starts_with('-')
    }
}

/// Value of `key: value` on this line (comment stripped), if the line holds `key`
fn value_of(line: &str, key: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix(key)?;
    let rest = rest.strip_prefix(':')?;
    if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
        return None;
    }
    let value = strip_comment(rest).trim();
    let value = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .unwrap_or(value);
    Some(value.to_string())
}

fn strip_comment(value: &str) -> &str {
    match value.find(" #") {
        Some(idx) => &value[..idx],
        None => value,
    }
}

fn trailing_comment(line: &str) -> &str {
    let value_start = line.find(':').map(|i| i + 1).unwrap_or(line.len());
    let rest = &line[value_start..];
    match rest.find(" #") {
        Some(idx) => {
            // Keep the original padding between value and comment.
            let value_end = rest[..idx].trim_end().len();
            rest[value_end..].trim_end()
        }
        None => "",
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn split_eol(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// Replace `:<old>` only where it is followed by a non-digit
fn replace_port_token(line: &str, old: &str, new: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(idx) = rest.find(old) {
        let after = &rest[idx + old.len()..];
        out.push_str(&rest[..idx]);
        if after.starts_with(|c: char| c.is_ascii_digit()) {
            out.push_str(old);
        } else {
            out.push_str(new);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}
