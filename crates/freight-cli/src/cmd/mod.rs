pub mod check;
pub mod run;

use serde_json::Value;

/// Deed arguments from the command line: JSON when it parses, plain text
/// otherwise.
pub fn parse_args(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect()
}
