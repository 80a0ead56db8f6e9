use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::fmt::Write as _;

/// Output format selection for all subcommands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Single JSON object on stdout.
    Json,
    /// Indented `key: value` report on stdout.
    #[default]
    Human,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Human => write!(f, "human"),
        }
    }
}

/// Write a successful result to stdout.
pub fn emit<T: Serialize>(format: OutputFormat, value: &T) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(value)?),
        OutputFormat::Human => print!("{}", render_human(&serde_json::to_value(value)?)),
    }
    Ok(())
}

/// Write an error to stdout (JSON mode) or stderr (human mode).
pub fn emit_error(format: OutputFormat, exit_code: u8, message: &str) {
    match format {
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "error": message,
                "exit_code": exit_code,
            });
            // JSON errors go to stdout so the caller always gets valid JSON on stdout.
            println!("{obj}");
        }
        OutputFormat::Human => {
            eprintln!("error: {message}");
        }
    }
}

/// Render a report as indented `key: value` lines.
///
/// Objects nest by two spaces; arrays of objects are separated by `-` markers.
pub fn render_human(value: &Value) -> String {
    let mut out = String::new();
    render_into(&mut out, value, 0);
    out
}

fn render_into(out: &mut String, value: &Value, depth: usize) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Object(map) => {
            for (key, field) in map {
                match field {
                    Value::Object(_) => {
                        let _ = writeln!(out, "{pad}{key}:");
                        render_into(out, field, depth + 1);
                    }
                    Value::Array(items) if items.iter().any(is_nested) => {
                        let _ = writeln!(out, "{pad}{key}:");
                        render_into(out, field, depth + 1);
                    }
                    _ => {
                        let _ = writeln!(out, "{pad}{key}: {}", scalar(field));
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                if is_nested(item) {
                    let _ = writeln!(out, "{pad}-");
                    render_into(out, item, depth + 1);
                } else {
                    let _ = writeln!(out, "{pad}- {}", scalar(item));
                }
            }
        }
        other => {
            let _ = writeln!(out, "{pad}{}", scalar(other));
        }
    }
}

fn is_nested(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        Value::Array(items) => items.iter().map(scalar).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_render_nests_objects_and_lists() {
        let value = serde_json::json!({
            "file": "a.plam",
            "header": {"cpu": "x86_64"},
            "flags": ["pie", "aslr"],
            "sections": [{"name": ".text"}],
        });
        let text = render_human(&value);
        assert!(text.contains("file: a.plam\n"));
        assert!(text.contains("header:\n  cpu: x86_64\n"));
        assert!(text.contains("flags: pie, aslr\n"));
        assert!(text.contains("sections:\n  -\n    name: .text\n"));
    }

    #[test]
    fn null_renders_as_dash() {
        assert_eq!(render_human(&serde_json::json!({"entry": null})), "entry: -\n");
    }

    #[test]
    fn output_format_display() {
        assert_eq!(OutputFormat::Json.to_string(), "json");
        assert_eq!(OutputFormat::Human.to_string(), "human");
    }

    #[test]
    fn output_format_default_is_human() {
        assert_eq!(OutputFormat::default(), OutputFormat::Human);
    }
}
