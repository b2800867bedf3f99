use serde::Deserialize;

/// One line of `claude --output-format stream-json`. Only the fields the
/// fixer needs are modelled; everything else is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    System {
        session_id: Option<String>,
    },
    Assistant {
        message: Option<TurnMessage>,
    },
    Result {
        result: Option<String>,
        session_id: Option<String>,
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TurnMessage {
    #[serde(default)]
    content: Vec<TurnBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TurnBlock {
    Text { text: String },
    ToolUse { name: String },
    #[serde(other)]
    Other,
}

/// What a finished stream boiled down to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Final answer text: the result event, else all assistant text.
    pub text: String,
    pub session_id: Option<String>,
    pub is_error: bool,
    /// Names of tools the agent invoked, in order.
    pub tools_used: Vec<String>,
}

/// Parse a full NDJSON stream. Non-JSON lines are skipped.
pub fn parse_stream(data: &str) -> StreamSummary {
    let mut summary = StreamSummary::default();
    let mut result_text = String::new();
    let mut assistant_text = String::new();

    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<StreamLine>(line) else {
            continue;
        };
        match parsed {
            StreamLine::System { session_id } => {
                summary.session_id = session_id.or(summary.session_id.take());
            }
            StreamLine::Assistant { message } => {
                for block in message.map(|m| m.content).unwrap_or_default() {
                    match block {
                        TurnBlock::Text { text } => {
                            if !assistant_text.is_empty() {
                                assistant_text.push('\n');
                            }
                            assistant_text.push_str(&text);
                        }
                        TurnBlock::ToolUse { name } => summary.tools_used.push(name),
                        TurnBlock::Other => {}
                    }
                }
            }
            StreamLine::Result { result, session_id, is_error } => {
                summary.session_id = session_id.or(summary.session_id.take());
                if let Some(text) = result {
                    result_text = text;
                }
                summary.is_error = is_error.unwrap_or(false);
            }
            StreamLine::Other => {}
        }
    }

    // The marker contract may span several assistant turns; prefer the
    // result only when it carries the markers itself.
    summary.text = if result_text.is_empty()
        || (!result_text.contains("<<<") && assistant_text.contains("<<<"))
    {
        assistant_text
    } else {
        result_text
    };
    summary
}
