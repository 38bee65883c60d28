//! JSONC acceptance layer.
//!
//! Standard JSON is parsed as-is. When that fails, the input is standardized
//! (line/block comments stripped, trailing commas removed) and parsed again.
//! If standardization itself fails, the original parse error is surfaced.

use std::io::Read;

use serde::de::DeserializeOwned;

/// Deserialize `input`, accepting JSONC on top of standard JSON.
pub fn from_str<T: DeserializeOwned>(input: &str) -> Result<T, serde_json::Error> {
    match serde_json::from_str(input) {
        Ok(value) => Ok(value),
        Err(original) => match standardize(input) {
            Some(standardized) => serde_json::from_str(&standardized),
            None => Err(original),
        },
    }
}

/// Strip comments and trailing commas, yielding standard JSON.
///
/// Returns `None` when the input cannot be standardized (for example an
/// unterminated block comment).
pub fn standardize(input: &str) -> Option<String> {
    let mut stripped = String::with_capacity(input.len());
    let mut reader = json_comments::StripComments::new(input.as_bytes());
    reader.read_to_string(&mut stripped).ok()?;
    Some(strip_trailing_commas(&stripped))
}

/// Remove commas that directly precede a closing `}` or `]` outside strings.
fn strip_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in input.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '}' | ']' => {
                // Drop a comma separated from the bracket only by whitespace.
                let trimmed_len = out.trim_end().len();
                if out[..trimmed_len].ends_with(',') {
                    let tail = out.split_off(trimmed_len - 1);
                    out.extend(tail.chars().skip(1));
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::HashMap;

    #[test]
    fn plain_json_passes_through() {
        let parsed: HashMap<String, u32> = from_str(r#"{"a": 1}"#).unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[test]
    fn comments_and_trailing_commas() {
        let input = r#"{
            // line comment
            "a": 1,
            /* block
               comment */
            "b": "x",
        }"#;
        let parsed: Value = from_str(input).unwrap();
        assert_eq!(parsed["a"], 1);
        assert_eq!(parsed["b"], "x");
    }

    #[test]
    fn equivalent_to_standard_form() {
        let jsonc = r#"{"servers": ["a", "b",], /* note */ "count": 2,}"#;
        let standard = r#"{"servers": ["a", "b"], "count": 2}"#;
        let a: Value = from_str(jsonc).unwrap();
        let b: Value = from_str(standard).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn trailing_comma_in_nested_arrays() {
        let parsed: Value = from_str(r#"[[1, 2,], [3,],]"#).unwrap();
        assert_eq!(parsed, serde_json::json!([[1, 2], [3]]));
    }

    #[test]
    fn comma_inside_string_untouched() {
        let parsed: Value = from_str(r#"{"a": "x,]", }"#).unwrap();
        assert_eq!(parsed["a"], "x,]");
    }

    #[test]
    fn original_error_when_not_jsonc() {
        let err = from_str::<Value>("{not json at all").unwrap_err();
        assert!(err.is_syntax());
    }
}
