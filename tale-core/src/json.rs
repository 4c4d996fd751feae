//! Parsing structured model output, with bounded repair.
//!
//! Models sometimes wrap JSON in markdown, surround it with prose, leave
//! trailing commas, or get cut off mid-object. [`parse_json`] first tries a
//! clean parse of the (fence-stripped) text. If that fails it applies one
//! structural repair pass and tries again, reporting which path succeeded.

use serde::de::DeserializeOwned;

/// How a value was obtained from model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Parsed as given (after removing a markdown fence, if any).
    Clean,
    /// Parsed only after structural repair.
    Repaired,
}

/// A parsed value and how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    pub outcome: ParseOutcome,
}

impl<T> Parsed<T> {
    pub fn was_repaired(&self) -> bool {
        self.outcome == ParseOutcome::Repaired
    }
}

/// Parse model output into `T`, repairing near-JSON when needed.
///
/// Returns a description of the failure if neither attempt parses.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<Parsed<T>, String> {
    let candidate = extract_json(text);

    let clean_err = match serde_json::from_str::<T>(candidate) {
        Ok(value) => {
            return Ok(Parsed {
                value,
                outcome: ParseOutcome::Clean,
            })
        }
        Err(e) => e,
    };

    let Some(repaired) = repair_json(candidate) else {
        return Err(format!("no JSON found: {clean_err}"));
    };

    match serde_json::from_str::<T>(&repaired) {
        Ok(value) => {
            tracing::debug!("model output parsed after JSON repair");
            Ok(Parsed {
                value,
                outcome: ParseOutcome::Repaired,
            })
        }
        Err(e) => Err(format!("{e} (after repair; original error: {clean_err})")),
    }
}

/// Extract JSON from a response that might have markdown code blocks.
fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // Handle ```json ... ``` blocks
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Handle ``` ... ``` blocks (without json specifier)
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    text
}

/// One pass of structural repair.
///
/// Starts at the first `{` or `[`, stops after the outermost value closes,
/// drops trailing commas, and closes an unterminated string and any
/// unbalanced brackets. Returns `None` if there is no object or array.
fn repair_json(text: &str) -> Option<String> {
    let start = text.find(|c| c == '{' || c == '[')?;
    let body = &text[start..];

    let mut out = String::with_capacity(body.len() + 8);
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in body.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if closers.last() != Some(&c) {
                    break;
                }
                strip_trailing_comma(&mut out);
                closers.pop();
                out.push(c);
                if closers.is_empty() {
                    break;
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        out.push('"');
    }
    while let Some(closer) = closers.pop() {
        strip_trailing_comma(&mut out);
        out.push(closer);
    }

    Some(out)
}

fn strip_trailing_comma(out: &mut String) {
    let trimmed = out.trim_end().len();
    if out[..trimmed].ends_with(',') {
        out.truncate(trimmed - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Endpoint {
        endpoint_turn: u64,
        #[serde(default)]
        title: Option<String>,
    }

    #[test]
    fn test_extract_json_markdown() {
        let text = "```json\n{\"endpoint_turn\": 3}\n```";
        assert_eq!(extract_json(text), "{\"endpoint_turn\": 3}");
    }

    #[test]
    fn test_clean_parse() {
        let parsed: Parsed<Endpoint> = parse_json(r#"{"endpoint_turn": 12}"#).unwrap();
        assert_eq!(parsed.outcome, ParseOutcome::Clean);
        assert_eq!(parsed.value.endpoint_turn, 12);
    }

    #[test]
    fn test_fenced_parse_is_clean() {
        let parsed: Parsed<Endpoint> =
            parse_json("```\n{\"endpoint_turn\": 4, \"title\": \"Dawn\"}\n```").unwrap();
        assert!(!parsed.was_repaired());
        assert_eq!(parsed.value.title.as_deref(), Some("Dawn"));
    }

    #[test]
    fn test_surrounding_prose_is_repaired() {
        let parsed: Parsed<Endpoint> =
            parse_json(r#"Sure! Here it is: {"endpoint_turn": 7} Let me know."#).unwrap();
        assert_eq!(parsed.outcome, ParseOutcome::Repaired);
        assert_eq!(parsed.value.endpoint_turn, 7);
    }

    #[test]
    fn test_trailing_comma_is_repaired() {
        let parsed: Parsed<Vec<u32>> = parse_json("[1, 2, 3,]").unwrap();
        assert!(parsed.was_repaired());
        assert_eq!(parsed.value, vec![1, 2, 3]);
    }

    #[test]
    fn test_truncated_object_is_repaired() {
        let parsed: Parsed<Endpoint> =
            parse_json(r#"{"endpoint_turn": 9, "title": "The Long Nig"#).unwrap();
        assert!(parsed.was_repaired());
        assert_eq!(parsed.value.title.as_deref(), Some("The Long Nig"));
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let parsed: Parsed<Endpoint> =
            parse_json(r#"{"endpoint_turn": 2, "title": "A } strange [ title",}"#).unwrap();
        assert_eq!(parsed.value.title.as_deref(), Some("A } strange [ title"));
    }

    #[test]
    fn test_unrepairable_output_fails() {
        assert!(parse_json::<Endpoint>("I could not decide.").is_err());
        assert!(parse_json::<Endpoint>(r#"{"endpoint_turn": "#).is_err());
        assert!(parse_json::<Endpoint>(r#"{"title": "missing field"}"#).is_err());
    }
}
