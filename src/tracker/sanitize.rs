//! Name sanitization pipeline
//!
//! Trackers disagree about acceptable release names. Each schema may
//! declare an ordered list of operations applied to the name before
//! upload; unknown operation types are ignored rather than fatal so an
//! old schema keeps working against a newer build.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One sanitization step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeOp {
    #[serde(rename = "type")]
    pub op: String,
    /// For replace_spaces
    pub replacement: Option<String>,
    /// For remove_pattern
    pub pattern: Option<String>,
    /// For max_length
    pub length: Option<usize>,
}

/// Apply the operations in order.
pub fn sanitize_name(name: &str, operations: &[SanitizeOp]) -> String {
    let mut result = name.to_string();

    for op in operations {
        match op.op.as_str() {
            "replace_spaces" => {
                let replacement = op.replacement.as_deref().unwrap_or(".");
                result = result.replace(' ', replacement);
            }
            "remove_pattern" => {
                if let Some(pattern) = &op.pattern {
                    match Regex::new(pattern) {
                        Ok(re) => result = re.replace_all(&result, "").to_string(),
                        Err(e) => {
                            warn!(pattern = %pattern, error = %e, "Invalid sanitize pattern")
                        }
                    }
                }
            }
            "collapse_dots" => {
                let re = Regex::new(r"\.{2,}").unwrap();
                result = re.replace_all(&result, ".").to_string();
            }
            "strip_dots" => {
                result = result.trim_matches('.').to_string();
            }
            "max_length" => {
                let length = op.length.unwrap_or(255);
                if result.len() > length {
                    result.truncate(length);
                }
            }
            "lowercase" => result = result.to_lowercase(),
            "uppercase" => result = result.to_uppercase(),
            other => warn!(op = other, "Unknown sanitize operation, skipping"),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: &str) -> SanitizeOp {
        SanitizeOp {
            op: kind.to_string(),
            replacement: None,
            pattern: None,
            length: None,
        }
    }

    #[test]
    fn test_pipeline_order_matters() {
        let ops = vec![
            SanitizeOp {
                op: "remove_pattern".into(),
                pattern: Some(r"\(.*?\)".into()),
                ..op("remove_pattern")
            },
            op("replace_spaces"),
            op("collapse_dots"),
            op("strip_dots"),
        ];
        let result = sanitize_name("The Movie (Director Cut) 2021 ", &ops);
        assert_eq!(result, "The.Movie.2021");
    }

    #[test]
    fn test_max_length_truncates() {
        let ops = vec![SanitizeOp {
            length: Some(5),
            ..op("max_length")
        }];
        assert_eq!(sanitize_name("abcdefgh", &ops), "abcde");
    }

    #[test]
    fn test_unknown_op_is_skipped() {
        let ops = vec![op("frobnicate"), op("uppercase")];
        assert_eq!(sanitize_name("abc", &ops), "ABC");
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        assert_eq!(sanitize_name("As.Is-NAME", &[]), "As.Is-NAME");
    }
}
