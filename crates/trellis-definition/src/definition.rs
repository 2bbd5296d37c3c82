use std::collections::HashMap;

use trellis_config::{Branch, ElementDef, ElementType, ProcessDef};

use crate::error::DefinitionError;
use crate::graph::Graph;

/// A validated process definition ready for advancement.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
  def: ProcessDef,
  /// element_id -> position in `def.elements`.
  index: HashMap<String, usize>,
  graph: Graph,
}

impl ProcessDefinition {
  /// Validate a definition and build its graph.
  pub fn new(def: ProcessDef) -> Result<Self, DefinitionError> {
    let mut index = HashMap::with_capacity(def.elements.len());
    for (position, element) in def.elements.iter().enumerate() {
      if index.insert(element.element_id.clone(), position).is_some() {
        return Err(DefinitionError::DuplicateElement(
          element.element_id.clone(),
        ));
      }
    }

    for flow in &def.flows {
      if !index.contains_key(&flow.from) || !index.contains_key(&flow.to) {
        return Err(DefinitionError::InvalidFlow {
          from: flow.from.clone(),
          to: flow.to.clone(),
        });
      }
      if flow.branch != Branch::Always {
        let source = &def.elements[index[&flow.from]];
        if !matches!(source.element_type, ElementType::Gateway { .. }) {
          return Err(DefinitionError::BranchOutsideGateway {
            from: flow.from.clone(),
          });
        }
      }
    }

    let graph = Graph::new(
      def.elements.iter().map(|e| e.element_id.as_str()),
      &def.flows,
    );

    let starts: Vec<&ElementDef> = def.elements.iter().filter(|e| e.is_start()).collect();
    if starts.is_empty() {
      return Err(DefinitionError::NoStartEvent(def.name.clone()));
    }
    for start in starts {
      if !graph.upstream(&start.element_id).is_empty() {
        return Err(DefinitionError::StartEventHasIncoming(
          start.element_id.clone(),
        ));
      }
    }

    for element in &def.elements {
      if let ElementType::SubProcess { definition } = &element.element_type {
        ProcessDefinition::new((**definition).clone()).map_err(|e| DefinitionError::SubProcess {
          element_id: element.element_id.clone(),
          source: Box::new(e),
        })?;
      }
    }

    Ok(Self { def, index, graph })
  }

  /// The definition this was built from.
  pub fn def(&self) -> &ProcessDef {
    &self.def
  }

  pub fn name(&self) -> &str {
    &self.def.name
  }

  pub fn target_type(&self) -> Option<&str> {
    self.def.target_type.as_deref()
  }

  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// Get an element by ID.
  pub fn element(&self, element_id: &str) -> Option<&ElementDef> {
    self.index.get(element_id).map(|&i| &self.def.elements[i])
  }

  /// Position of an element in definition order.
  pub fn position(&self, element_id: &str) -> Option<usize> {
    self.index.get(element_id).copied()
  }

  /// Start events in definition order.
  pub fn start_elements(&self) -> Vec<&ElementDef> {
    self.def.elements.iter().filter(|e| e.is_start()).collect()
  }

  /// Elements activated when `element_id` completes.
  ///
  /// `outcome` is the gateway result: `Some(true)` follows `true` and
  /// unconditional edges, `Some(false)` follows `false` edges only. `None`
  /// (every non-gateway element) follows unconditional edges.
  pub fn successors(
    &self,
    element_id: &str,
    outcome: Option<bool>,
  ) -> Result<Vec<&ElementDef>, DefinitionError> {
    if !self.index.contains_key(element_id) {
      return Err(DefinitionError::ElementNotFound(element_id.to_string()));
    }

    let branches: &[Branch] = match outcome {
      None => &[Branch::Always],
      Some(true) => &[Branch::True, Branch::Always],
      Some(false) => &[Branch::False],
    };

    self
      .graph
      .downstream(element_id, branches)
      .into_iter()
      .map(|id| {
        self
          .element(id)
          .ok_or_else(|| DefinitionError::ElementNotFound(id.to_string()))
      })
      .collect()
  }

  /// Whether the element has an explicit `false` edge.
  pub fn has_alternate(&self, element_id: &str) -> bool {
    self
      .graph
      .outgoing(element_id)
      .iter()
      .any(|(_, branch)| *branch == Branch::False)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn approval_def() -> ProcessDef {
    serde_json::from_value(json!({
      "name": "Approval",
      "targetType": "Opportunity",
      "elements": [
        { "elementId": "start", "type": "startEvent" },
        { "elementId": "gw", "type": "gateway", "condition": { "fieldToCompare": "stage", "value": "Won" } },
        { "elementId": "celebrate", "type": "task", "action": { "type": "noop" } },
        { "elementId": "console", "type": "task", "action": { "type": "noop" } },
        { "elementId": "end", "type": "endEvent" }
      ],
      "flows": [
        { "from": "start", "to": "gw" },
        { "from": "gw", "to": "celebrate", "branch": "true" },
        { "from": "gw", "to": "console", "branch": "false" },
        { "from": "celebrate", "to": "end" },
        { "from": "console", "to": "end" }
      ]
    }))
    .unwrap()
  }

  #[test]
  fn test_successors_per_outcome() {
    let definition = ProcessDefinition::new(approval_def()).unwrap();

    let ids = |elements: Vec<&ElementDef>| -> Vec<String> {
      elements.into_iter().map(|e| e.element_id.clone()).collect()
    };

    assert_eq!(ids(definition.successors("start", None).unwrap()), vec!["gw"]);
    assert_eq!(ids(definition.successors("gw", Some(true)).unwrap()), vec!["celebrate"]);
    assert_eq!(ids(definition.successors("gw", Some(false)).unwrap()), vec!["console"]);
    assert!(definition.successors("end", None).unwrap().is_empty());
    assert!(definition.has_alternate("gw"));
    assert_eq!(definition.position("celebrate"), Some(2));
  }

  #[test]
  fn test_unknown_element_lookup_fails() {
    let definition = ProcessDefinition::new(approval_def()).unwrap();
    assert!(matches!(
      definition.successors("nope", None),
      Err(DefinitionError::ElementNotFound(id)) if id == "nope"
    ));
  }

  #[test]
  fn test_rejects_duplicate_elements() {
    let mut def = approval_def();
    def.elements.push(def.elements[0].clone());
    assert!(matches!(
      ProcessDefinition::new(def),
      Err(DefinitionError::DuplicateElement(id)) if id == "start"
    ));
  }

  #[test]
  fn test_rejects_dangling_flow() {
    let mut def = approval_def();
    def.flows.push(trellis_config::FlowDef::new("end", "missing"));
    assert!(matches!(
      ProcessDefinition::new(def),
      Err(DefinitionError::InvalidFlow { .. })
    ));
  }

  #[test]
  fn test_rejects_branch_from_task() {
    let mut def = approval_def();
    def.flows.push(trellis_config::FlowDef::with_branch(
      "celebrate",
      "end",
      Branch::False,
    ));
    assert!(matches!(
      ProcessDefinition::new(def),
      Err(DefinitionError::BranchOutsideGateway { from }) if from == "celebrate"
    ));
  }

  #[test]
  fn test_requires_start_event() {
    let def: ProcessDef = serde_json::from_value(json!({
      "name": "Headless",
      "elements": [{ "elementId": "end", "type": "endEvent" }]
    }))
    .unwrap();
    assert!(matches!(
      ProcessDefinition::new(def),
      Err(DefinitionError::NoStartEvent(name)) if name == "Headless"
    ));
  }

  #[test]
  fn test_validates_nested_sub_process() {
    let def: ProcessDef = serde_json::from_value(json!({
      "name": "Parent",
      "elements": [
        { "elementId": "start", "type": "startEvent" },
        {
          "elementId": "child",
          "type": "subProcess",
          "definition": { "name": "Broken child", "elements": [] }
        }
      ],
      "flows": [{ "from": "start", "to": "child" }]
    }))
    .unwrap();

    match ProcessDefinition::new(def) {
      Err(DefinitionError::SubProcess { element_id, source }) => {
        assert_eq!(element_id, "child");
        assert!(matches!(*source, DefinitionError::NoStartEvent(_)));
      }
      other => panic!("expected sub-process error, got {:?}", other),
    }
  }
}
