//! DAG compilation: validation and Kahn layering (§4.6)

use std::collections::{HashMap, HashSet};

use super::definition::WorkflowDefinition;
use super::WorkflowError;

/// Reject empty id/name, duplicate step ids, unknown dependency references,
/// or a cyclic dependency graph, then compute the Kahn layering: repeatedly
/// extract the subset of not-yet-scheduled steps whose dependencies are all
/// already scheduled. A non-empty remainder with no extractable layer is a
/// cycle.
pub fn compile(definition: &WorkflowDefinition) -> std::result::Result<Vec<Vec<String>>, WorkflowError> {
    if definition.id.is_empty() || definition.name.is_empty() {
        return Err(WorkflowError::InvalidDefinition(
            "workflow id and name must be non-empty".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for step in &definition.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(WorkflowError::InvalidDefinition(format!(
                "duplicate step id: {}",
                step.id
            )));
        }
    }

    let known: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &definition.steps {
        for dep in &step.dependencies {
            if !known.contains(dep.as_str()) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "step {} depends on unknown step {}",
                    step.id, dep
                )));
            }
        }
    }

    let mut remaining: HashMap<&str, &Vec<String>> = definition
        .steps
        .iter()
        .map(|s| (s.id.as_str(), &s.dependencies))
        .collect();
    let mut completed: HashSet<&str> = HashSet::new();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let layer: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| completed.contains(d.as_str())))
            .map(|(id, _)| *id)
            .collect();

        if layer.is_empty() {
            return Err(WorkflowError::CycleDetected);
        }

        for id in &layer {
            remaining.remove(id);
            completed.insert(id);
        }

        let mut layer: Vec<String> = layer.into_iter().map(String::from).collect();
        layer.sort(); // deterministic ordering within a layer for reproducible tests
        layers.push(layer);
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::Step;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop;
    #[async_trait]
    impl crate::workflow::definition::StepExecutor for Noop {
        async fn execute(
            &self,
            _vars: &crate::workflow::definition::Variables,
        ) -> std::result::Result<serde_json::Value, String> {
            Ok(serde_json::Value::Null)
        }
    }

    fn def(steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf1".to_string(),
            name: "wf".to_string(),
            version: "1".to_string(),
            steps,
            max_concurrent_steps: 4,
            rollback_on_error: false,
            rollback_on_cancel: false,
            continue_on_error: false,
            variables: Default::default(),
            timeout: None,
        }
    }

    #[test]
    fn linear_chain_layers_in_order() {
        let steps = vec![
            Step::builder("A", Arc::new(Noop)).build(),
            Step::builder("B", Arc::new(Noop)).depends_on(["A"]).build(),
            Step::builder("C", Arc::new(Noop)).depends_on(["B"]).build(),
        ];
        let layers = compile(&def(steps)).unwrap();
        assert_eq!(layers, vec![vec!["A"], vec!["B"], vec!["C"]]);
    }

    #[test]
    fn cycle_is_detected() {
        let steps = vec![
            Step::builder("A", Arc::new(Noop)).depends_on(["B"]).build(),
            Step::builder("B", Arc::new(Noop)).depends_on(["A"]).build(),
        ];
        let err = compile(&def(steps)).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected));
    }

    #[test]
    fn duplicate_step_ids_rejected() {
        let steps = vec![
            Step::builder("A", Arc::new(Noop)).build(),
            Step::builder("A", Arc::new(Noop)).build(),
        ];
        let err = compile(&def(steps)).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDefinition(_)));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let steps = vec![Step::builder("A", Arc::new(Noop)).depends_on(["ghost"]).build()];
        let err = compile(&def(steps)).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDefinition(_)));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // A linear chain of any length always compiles to exactly that
            // many layers, one step apiece, in dependency order.
            #[test]
            fn linear_chain_of_any_length_yields_one_step_per_layer(len in 1usize..16) {
                let mut steps = Vec::new();
                for i in 0..len {
                    let id = format!("s{i}");
                    let builder = Step::builder(id, Arc::new(Noop));
                    let step = if i == 0 {
                        builder.build()
                    } else {
                        builder.depends_on([format!("s{}", i - 1)]).build()
                    };
                    steps.push(step);
                }
                let layers = compile(&def(steps)).unwrap();
                prop_assert_eq!(layers.len(), len);
                for (i, layer) in layers.iter().enumerate() {
                    prop_assert_eq!(layer, &vec![format!("s{i}")]);
                }
            }

            // A set of independent steps (no dependencies among them) always
            // compiles to a single layer containing all of them.
            #[test]
            fn independent_steps_share_one_layer(count in 1usize..16) {
                let steps: Vec<Step> = (0..count)
                    .map(|i| Step::builder(format!("s{i}"), Arc::new(Noop)).build())
                    .collect();
                let layers = compile(&def(steps)).unwrap();
                prop_assert_eq!(layers.len(), 1);
                prop_assert_eq!(layers[0].len(), count);
            }
        }
    }
}
