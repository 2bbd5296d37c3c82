use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde_json::Value;

/// Everything a condition can read.
///
/// Field paths resolve as follows:
/// - `status` reads an attribute of the target entity
/// - `account.industry` reads an attribute of the entity linked as `account`
/// - `$attempt` reads a process variable (`$a.b` walks into objects)
///
/// Anything that does not resolve is `null`.
#[derive(Debug, Clone)]
pub struct EvaluationContext<'a> {
  pub process_id: &'a str,
  pub entity: &'a Value,
  pub linked: &'a HashMap<String, Value>,
  pub variables: &'a Value,
  pub now: DateTime<Utc>,
  pub time_zone: FixedOffset,
}

impl<'a> EvaluationContext<'a> {
  pub fn new(
    process_id: &'a str,
    entity: &'a Value,
    linked: &'a HashMap<String, Value>,
    variables: &'a Value,
  ) -> Self {
    Self {
      process_id,
      entity,
      linked,
      variables,
      now: Utc::now(),
      time_zone: Utc.fix(),
    }
  }

  pub fn at(mut self, now: DateTime<Utc>) -> Self {
    self.now = now;
    self
  }

  pub fn in_time_zone(mut self, time_zone: FixedOffset) -> Self {
    self.time_zone = time_zone;
    self
  }

  /// Resolve a field path to a value.
  pub fn resolve(&self, path: &str) -> Value {
    if let Some(variable) = path.strip_prefix('$') {
      return walk(self.variables, variable.split('.'));
    }

    match path.split_once('.') {
      Some((link, attribute)) => match self.linked.get(link) {
        Some(linked) => walk(linked, attribute.split('.')),
        // Not a loaded relation: treat it as a nested attribute.
        None => walk(self.entity, path.split('.')),
      },
      None => self.entity.get(path).cloned().unwrap_or(Value::Null),
    }
  }
}

fn walk<'p>(root: &Value, segments: impl Iterator<Item = &'p str>) -> Value {
  let mut current = root;
  for segment in segments {
    match current.get(segment) {
      Some(next) => current = next,
      None => return Value::Null,
    }
  }
  current.clone()
}

/// Link names a set of field paths reads through, e.g. `account` for
/// `account.industry`. Variables are excluded.
pub fn required_links<'p>(paths: impl IntoIterator<Item = &'p str>) -> Vec<&'p str> {
  let mut links: Vec<&str> = paths
    .into_iter()
    .filter(|path| !path.starts_with('$'))
    .filter_map(|path| path.split_once('.').map(|(link, _)| link))
    .collect();
  links.sort_unstable();
  links.dedup();
  links
}
