//! Tool definitions exposed to the model.
//!
//! Tools are plain structs deriving [`Tool`](crate::Tool); the derive fills
//! in [`ToolSchema`] from the struct and field doc comments.

use claude::Tool;
use serde_json::Value;

/// Schema information for a tool the model may call.
pub trait ToolSchema {
    /// Name the model uses to call the tool.
    const NAME: &'static str;

    fn description() -> &'static str;

    /// JSON schema of the tool input.
    fn input_schema() -> Value;

    /// Tool definition for the Claude API.
    fn as_tool() -> Tool {
        Tool {
            name: Self::NAME.to_string(),
            description: Self::description().to_string(),
            input_schema: Self::input_schema(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tool;
    use serde::Deserialize;

    /// Look up a character by name
    #[derive(Tool, Deserialize)]
    #[tool(name = "find_character")]
    #[allow(dead_code)]
    struct FindCharacter {
        /// Character name
        name: String,
        /// Limit on results
        #[tool(minimum = 1)]
        limit: Option<u32>,
    }

    /// Do nothing
    #[derive(Tool)]
    struct Noop {}

    #[test]
    fn test_derived_schema() {
        assert_eq!(FindCharacter::NAME, "find_character");
        assert_eq!(FindCharacter::description(), "Look up a character by name");

        let schema = FindCharacter::input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["name"]["type"], "string");
        assert_eq!(schema["properties"]["name"]["description"], "Character name");
        assert_eq!(schema["properties"]["limit"]["minimum"], 1);
        assert_eq!(schema["required"], serde_json::json!(["name"]));
    }

    #[test]
    fn test_default_name_and_empty_schema() {
        assert_eq!(Noop::NAME, "noop");
        let tool = Noop::as_tool();
        assert_eq!(tool.name, "noop");
        assert_eq!(tool.input_schema["required"], serde_json::json!([]));
    }
}
