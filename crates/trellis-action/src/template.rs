//! Payload template rendering.
//!
//! Every string in an action payload is a minijinja template rendered
//! against the action context:
//!
//! ```json
//! { "type": "log", "message": "Case {{ target.name }} reached {{ variables.stage }}" }
//! ```
//!
//! Strings without template markers are left untouched.

use minijinja::{Environment, Value};

use crate::error::ActionError;

/// Render every string in `payload`, recursing into arrays and objects.
pub fn render_payload(
  env: &Environment<'_>,
  process_id: &str,
  payload: &serde_json::Value,
  context: &serde_json::Value,
) -> Result<serde_json::Value, ActionError> {
  let ctx_value = Value::from_serialize(context);
  render_value(env, process_id, "", payload, &ctx_value)
}

fn render_value(
  env: &Environment<'_>,
  process_id: &str,
  path: &str,
  value: &serde_json::Value,
  context: &Value,
) -> Result<serde_json::Value, ActionError> {
  match value {
    serde_json::Value::String(template) if is_template(template) => env
      .render_str(template, context.clone())
      .map(serde_json::Value::String)
      .map_err(|e| ActionError::Template {
        process_id: process_id.to_string(),
        field: path.to_string(),
        message: e.to_string(),
      }),
    serde_json::Value::Array(items) => items
      .iter()
      .enumerate()
      .map(|(i, item)| render_value(env, process_id, &format!("{}[{}]", path, i), item, context))
      .collect::<Result<Vec<_>, _>>()
      .map(serde_json::Value::Array),
    serde_json::Value::Object(map) => map
      .iter()
      .map(|(key, item)| {
        let child = if path.is_empty() {
          key.clone()
        } else {
          format!("{}.{}", path, key)
        };
        render_value(env, process_id, &child, item, context).map(|v| (key.clone(), v))
      })
      .collect::<Result<serde_json::Map<_, _>, _>>()
      .map(serde_json::Value::Object),
    other => Ok(other.clone()),
  }
}

fn is_template(s: &str) -> bool {
  s.contains("{{") || s.contains("{%")
}
