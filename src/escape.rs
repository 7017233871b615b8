//! Value escaping and `?` placeholder substitution, compatible with the
//! quoting rules of the MySQL client libraries.

use crate::value::Value;

/// Escape a single value for inlining into SQL text.
pub fn escape(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Text(s) => quote(s),
        Value::Bytes(b) => {
            let mut out = String::with_capacity(b.len() * 2 + 3);
            out.push_str("X'");
            for byte in b {
                out.push_str(&format!("{:02x}", byte));
            }
            out.push('\'');
            out
        }
    }
}

/// Escape an identifier (or `.`-qualified identifier path) with backticks.
pub fn escape_id(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Substitute `?` placeholders with escaped values and `??` placeholders
/// with escaped identifiers, in order. Placeholders beyond the parameter
/// list are left verbatim.
pub fn format(sql: &str, params: &[Value]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut params = params.iter();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '?' {
            out.push(c);
            continue;
        }
        let identifier = chars.peek() == Some(&'?');
        if identifier {
            chars.next();
        }
        match params.next() {
            None => {
                out.push('?');
                if identifier {
                    out.push('?');
                }
            }
            Some(Value::Text(s)) if identifier => out.push_str(&escape_id(s)),
            Some(v) => out.push_str(&escape(v)),
        }
    }
    out
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{8}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\u{1a}' => out.push_str("\\Z"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}
