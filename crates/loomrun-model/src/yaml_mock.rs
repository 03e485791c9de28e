//! Load a scripted conversation for `MockProvider` from a YAML fixture file.
//!
//! Test fixtures and example pipelines describe a multi-turn mock
//! conversation once, on disk, instead of constructing `MockStep` values
//! in every test.
//!
//! ```yaml
//! steps:
//!   - tool_calls:
//!       - call_id: c1
//!         name: calculate
//!         args: { expression: "134/4" }
//!   - text: "33.5"
//! ```

use serde::Deserialize;
use serde_json::Value;

use crate::mock::MockStep;

#[derive(Debug, Deserialize)]
struct YamlFixture {
    steps: Vec<YamlStep>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum YamlStep {
    Text {
        text: String,
    },
    ToolCalls {
        tool_calls: Vec<YamlToolCall>,
    },
}

#[derive(Debug, Deserialize)]
struct YamlToolCall {
    call_id: String,
    name: String,
    #[serde(default)]
    args: Value,
}

/// Parse a YAML fixture's text contents into a `MockStep` script.
pub fn parse_steps(yaml: &str) -> anyhow::Result<Vec<MockStep>> {
    let fixture: YamlFixture = serde_yaml::from_str(yaml)?;
    Ok(fixture
        .steps
        .into_iter()
        .map(|s| match s {
            YamlStep::Text { text } => MockStep::Text(text),
            YamlStep::ToolCalls { tool_calls } => MockStep::ToolCalls(
                tool_calls
                    .into_iter()
                    .map(|c| (c.call_id, c.name, c.args))
                    .collect(),
            ),
        })
        .collect())
}

/// Load and parse a fixture file from disk.
pub fn load_steps(path: &std::path::Path) -> anyhow::Result<Vec<MockStep>> {
    let text = std::fs::read_to_string(path)?;
    parse_steps(&text)
}
