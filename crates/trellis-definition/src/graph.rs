use std::collections::HashMap;

use trellis_config::{Branch, FlowDef};

/// Labelled adjacency structure for successor lookups.
#[derive(Debug, Clone, Default)]
pub struct Graph {
  /// Adjacency list: element_id -> list of (downstream element_id, branch).
  adjacency: HashMap<String, Vec<(String, Branch)>>,
  /// Reverse adjacency: element_id -> list of upstream element_ids.
  reverse_adjacency: HashMap<String, Vec<String>>,
}

impl Graph {
  /// Build a graph from element ids and flows. Flow order is preserved so
  /// successors come out in definition order.
  pub fn new<'a>(element_ids: impl IntoIterator<Item = &'a str>, flows: &[FlowDef]) -> Self {
    let mut adjacency: HashMap<String, Vec<(String, Branch)>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();

    for id in element_ids {
      adjacency.entry(id.to_string()).or_default();
      reverse_adjacency.entry(id.to_string()).or_default();
    }

    for flow in flows {
      adjacency
        .entry(flow.from.clone())
        .or_default()
        .push((flow.to.clone(), flow.branch));
      reverse_adjacency
        .entry(flow.to.clone())
        .or_default()
        .push(flow.from.clone());
    }

    Self {
      adjacency,
      reverse_adjacency,
    }
  }

  /// All outgoing edges of an element.
  pub fn outgoing(&self, element_id: &str) -> &[(String, Branch)] {
    self
      .adjacency
      .get(element_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Downstream elements reached through edges with one of the given branches.
  pub fn downstream(&self, element_id: &str, branches: &[Branch]) -> Vec<&str> {
    self
      .outgoing(element_id)
      .iter()
      .filter(|(_, branch)| branches.contains(branch))
      .map(|(to, _)| to.as_str())
      .collect()
  }

  /// Get upstream elements for a given element.
  pub fn upstream(&self, element_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(element_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }
}
