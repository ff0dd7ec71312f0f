use super::models::AgentContext;
use crate::application::plan::SubTask;
use crate::infrastructure::protocol::ToolDescriptor;
use serde_json::Value;
use tracing::debug;

/// What a completion told the agent to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Final { response: String },
    CallTool { tool: String, input: Value },
    /// Free-form text that carried no parseable directive. Treated as a
    /// reasoning note, never as an error.
    Note { content: String },
}

/// Best-effort JSON extraction from completion text: direct parse, then a
/// stripped ```json fence, then the outermost brace-delimited substring.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if trimmed.starts_with("```") {
        let stripped = trimmed.trim_start_matches("```json");
        let stripped = stripped.trim_start_matches("```JSON");
        let stripped = stripped.trim_start_matches("```");
        if let Some(end) = stripped.rfind("```") {
            let slice = &stripped[..end];
            if let Ok(value) = serde_json::from_str::<Value>(slice.trim()) {
                return Some(value);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            let candidate = &trimmed[start..=end];
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                return Some(value);
            }
        }
    }

    None
}

/// Decodes a decomposition completion into subtasks. Accepts either a bare
/// array or `{"subtasks": [...]}`; anything unusable degrades to a single
/// task covering the whole goal.
pub fn parse_subtasks(content: &str, goal: &str) -> Vec<SubTask> {
    let Some(value) = extract_json(content) else {
        debug!("decomposition produced no JSON, falling back to a single task");
        return fallback_plan(goal);
    };
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("subtasks") {
            Some(Value::Array(items)) => items,
            _ => return fallback_plan(goal),
        },
        _ => return fallback_plan(goal),
    };

    let mut tasks = Vec::new();
    for (position, item) in items.into_iter().enumerate() {
        let Value::Object(map) = item else { continue };
        let Some(title) = map.get("title").and_then(Value::as_str) else {
            continue;
        };
        let id = map
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("task-{}", position + 1));
        let description = map
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let depends_on = string_list(map.get("depends_on"));
        let required_tools = string_list(map.get("required_tools"));

        let mut task = SubTask::new(id, title).with_description(description);
        task.depends_on = depends_on;
        task.required_tools = required_tools;
        tasks.push(task);
    }

    if tasks.is_empty() {
        fallback_plan(goal)
    } else {
        tasks
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn fallback_plan(goal: &str) -> Vec<SubTask> {
    vec![SubTask::new("task-1", "Address the goal directly").with_description(goal)]
}

/// Decodes an action completion. Structured `call_tool`/`final` objects map
/// to their directives; everything else is kept verbatim as a note.
pub fn parse_directive(content: &str) -> Directive {
    let Some(Value::Object(map)) = extract_json(content) else {
        return Directive::Note {
            content: content.trim().to_string(),
        };
    };
    match map.get("action").and_then(Value::as_str) {
        Some("call_tool") => match map.get("tool").and_then(Value::as_str) {
            Some(tool) => Directive::CallTool {
                tool: tool.to_string(),
                input: map.get("input").cloned().unwrap_or(Value::Null),
            },
            None => Directive::Note {
                content: content.trim().to_string(),
            },
        },
        Some("final") => match map.get("response").and_then(Value::as_str) {
            Some(response) => Directive::Final {
                response: response.to_string(),
            },
            None => Directive::Note {
                content: content.trim().to_string(),
            },
        },
        _ => Directive::Note {
            content: content.trim().to_string(),
        },
    }
}

pub fn system_prompt(context: &AgentContext, catalog: &[ToolDescriptor]) -> String {
    let mut prompt = String::from(
        "You are an autonomous agent. Respond with a single JSON object: \
         {\"action\":\"call_tool\",\"tool\":<name>,\"input\":<object>} to use a tool, \
         or {\"action\":\"final\",\"response\":<text>} when the goal is satisfied.",
    );
    if !catalog.is_empty() {
        prompt.push_str("\n\nAvailable tools:");
        for tool in catalog {
            prompt.push_str("\n- ");
            prompt.push_str(&tool.name);
            if let Some(description) = &tool.description {
                prompt.push_str(": ");
                prompt.push_str(description);
            }
        }
    }
    if !context.constraints.is_empty() {
        prompt.push_str("\n\nConstraints:");
        for constraint in &context.constraints {
            prompt.push_str("\n- ");
            prompt.push_str(constraint);
        }
    }
    prompt
}

pub fn think_prompt(goal: &str) -> String {
    format!(
        "Goal: {goal}\n\nBriefly state your understanding of the goal and the key \
         unknowns before planning. Respond in plain text."
    )
}

pub fn decompose_prompt(goal: &str) -> String {
    format!(
        "Goal: {goal}\n\nDecompose this goal into ordered subtasks. Respond with JSON: \
         {{\"subtasks\":[{{\"id\":<string>,\"title\":<string>,\"description\":<string>,\
         \"depends_on\":[<id>...],\"required_tools\":[<name>...]}}]}}"
    )
}

pub fn action_prompt(task: &SubTask) -> String {
    format!(
        "Current subtask: {title}\n{description}\n\nDecide the next action for this \
         subtask and respond with a single JSON directive.",
        title = task.title,
        description = task.description,
    )
}

pub fn free_form_prompt(goal: &str) -> String {
    format!(
        "Goal: {goal}\n\nNo runnable subtask remains but the goal is not satisfied. \
         Take one reasoning step toward it and respond with a single JSON directive."
    )
}

pub fn synthesis_prompt(goal: &str) -> String {
    format!(
        "Goal: {goal}\n\nAll planned work is done. Synthesize the final answer from the \
         conversation so far. Respond in plain text."
    )
}

pub fn reflection_prompt(goal: &str) -> String {
    format!(
        "Goal: {goal}\n\nReflect briefly: what worked, what did not, and what should be \
         remembered for similar goals. Respond in plain text."
    )
}
