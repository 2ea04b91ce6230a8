//! Definition engine: pure routing and validation over a loaded definition.

use crate::model::{StageDefinition, WorkflowDefinition, WorkflowType};
use crate::EngineError;
use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

pub const ROUTE_END: &str = "END";
pub const ON_FAILURE_FAIL: &str = "fail";
pub const ON_FAILURE_SKIP: &str = "skip";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Failure,
}

/// Where a workflow goes after a stage settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Stage(String),
    End,
    Fail,
}

/// The entry stage: the single stage no routing edge points at. Falls back
/// to declaration order for definitions validated under older rules.
pub fn first_stage(def: &WorkflowDefinition) -> Result<String, EngineError> {
    if def.stages.is_empty() {
        return Err(EngineError::EmptyDefinition { definition: def.name.clone() });
    }

    let mut targeted: HashSet<&str> = HashSet::new();
    for stage in &def.stages {
        if stage.on_success != ROUTE_END {
            targeted.insert(stage.on_success.as_str());
        }
        if stage.on_failure != ON_FAILURE_FAIL && stage.on_failure != ON_FAILURE_SKIP {
            targeted.insert(stage.on_failure.as_str());
        }
    }

    Ok(def
        .stages
        .iter()
        .find(|s| !targeted.contains(s.name.as_str()))
        .unwrap_or(&def.stages[0])
        .name
        .clone())
}

/// Routing after `current_stage` settles with `outcome`.
///
/// Failure semantics: `fail` ends the workflow as failed, `skip` continues
/// with the next stage in declaration order, an explicit name jumps there.
pub fn next_stage(
    def: &WorkflowDefinition,
    current_stage: &str,
    outcome: StageOutcome,
) -> Result<Route, EngineError> {
    let stage = def.stage(current_stage).ok_or_else(|| EngineError::UnknownStage {
        stage: current_stage.to_string(),
        definition: def.name.clone(),
    })?;

    match outcome {
        StageOutcome::Success => {
            if stage.on_success == ROUTE_END {
                Ok(Route::End)
            } else {
                Ok(Route::Stage(stage.on_success.clone()))
            }
        }
        StageOutcome::Failure => match stage.on_failure.as_str() {
            ON_FAILURE_FAIL => Ok(Route::Fail),
            ON_FAILURE_SKIP => {
                let index = def.stage_index(current_stage).unwrap_or(0);
                match def.stages.get(index + 1) {
                    Some(next) => Ok(Route::Stage(next.name.clone())),
                    None => Ok(Route::End),
                }
            }
            target => Ok(Route::Stage(target.to_string())),
        },
    }
}

/// Progress over completed stages, rounded to a whole percent. A completed
/// workflow always reports 100 regardless of skipped stages.
pub fn calculate_progress(def: &WorkflowDefinition, completed_stages: &[String]) -> u8 {
    let total = def.stages.len();
    if total == 0 {
        return 0;
    }
    let known: HashSet<&str> = def.stages.iter().map(|s| s.name.as_str()).collect();
    let completed = completed_stages
        .iter()
        .filter(|s| known.contains(s.as_str()))
        .collect::<HashSet<_>>()
        .len();
    (((completed as f64 / total as f64) * 100.0).round() as u8).min(100)
}

/// Structural validation, run at definition-create time.
///
/// `agent_resolver` answers whether an agent type is registered for the
/// owning platform (or globally); see the registry's lookup precedence.
pub fn validate_definition(
    def: &WorkflowDefinition,
    agent_resolver: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut issues = Vec::new();

    if def.stages.is_empty() {
        issues.push("definition must declare at least one stage".to_string());
        return issues;
    }

    if semver::Version::parse(&def.version).is_err() {
        issues.push(format!("version {:?} is not valid semver", def.version));
    }

    let mut seen = HashSet::new();
    for stage in &def.stages {
        if stage.name.trim().is_empty() {
            issues.push("stage names must be non-empty".to_string());
        }
        if !seen.insert(stage.name.as_str()) {
            issues.push(format!("duplicate stage name {:?}", stage.name));
        }
        if stage.agent_type.trim().is_empty() {
            issues.push(format!("stage {:?} has an empty agent_type", stage.name));
        } else if !agent_resolver(&stage.agent_type) {
            issues.push(format!(
                "stage {:?} references unregistered agent type {:?}",
                stage.name, stage.agent_type
            ));
        }
        if stage.timeout_ms == 0 {
            issues.push(format!("stage {:?} must have a positive timeout", stage.name));
        }
    }

    let names: HashSet<&str> = def.stages.iter().map(|s| s.name.as_str()).collect();
    for stage in &def.stages {
        if stage.on_success != ROUTE_END && !names.contains(stage.on_success.as_str()) {
            issues.push(format!(
                "stage {:?} routes on_success to unknown stage {:?}",
                stage.name, stage.on_success
            ));
        }
        if stage.on_failure != ON_FAILURE_FAIL
            && stage.on_failure != ON_FAILURE_SKIP
            && !names.contains(stage.on_failure.as_str())
        {
            issues.push(format!(
                "stage {:?} routes on_failure to unknown stage {:?}",
                stage.name, stage.on_failure
            ));
        }
    }

    // Routing targets must form a DAG. Skip continuation edges count too:
    // they are real transitions at runtime.
    if issues.is_empty() {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        for stage in &def.stages {
            nodes.insert(stage.name.as_str(), graph.add_node(stage.name.as_str()));
        }
        for (index, stage) in def.stages.iter().enumerate() {
            let from = nodes[stage.name.as_str()];
            if stage.on_success != ROUTE_END {
                graph.add_edge(from, nodes[stage.on_success.as_str()], ());
            }
            match stage.on_failure.as_str() {
                ON_FAILURE_FAIL => {}
                ON_FAILURE_SKIP => {
                    if let Some(next) = def.stages.get(index + 1) {
                        graph.add_edge(from, nodes[next.name.as_str()], ());
                    }
                }
                target => {
                    graph.add_edge(from, nodes[target], ());
                }
            }
        }

        if toposort(&graph, None).is_err() {
            issues.push("stage graph contains a cycle".to_string());
        } else {
            let mut incoming: HashMap<&str, usize> = names.iter().map(|n| (*n, 0)).collect();
            for edge in graph.edge_indices() {
                if let Some((_, to)) = graph.edge_endpoints(edge) {
                    *incoming.entry(graph[to]).or_insert(0) += 1;
                }
            }
            let entries: Vec<&str> =
                incoming.iter().filter(|(_, count)| **count == 0).map(|(name, _)| *name).collect();
            if entries.len() != 1 {
                issues.push(format!(
                    "definition must have exactly one entry stage, found {}",
                    entries.len()
                ));
            } else {
                // Every stage must be reachable from the entry.
                let entry = nodes[entries[0]];
                let mut visited = HashSet::new();
                let mut queue = VecDeque::from([entry]);
                while let Some(node) = queue.pop_front() {
                    if visited.insert(node) {
                        queue.extend(graph.neighbors(node));
                    }
                }
                for stage in &def.stages {
                    if !visited.contains(&nodes[stage.name.as_str()]) {
                        issues.push(format!(
                            "stage {:?} is unreachable from the entry stage",
                            stage.name
                        ));
                    }
                }
            }
        }
    }

    issues
}

const DEFAULT_STAGE_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_STAGE_RETRIES: u32 = 2;

fn chain(stage_names: &[&str]) -> Vec<StageDefinition> {
    stage_names
        .iter()
        .enumerate()
        .map(|(index, name)| StageDefinition {
            name: name.to_string(),
            agent_type: name.to_string(),
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            max_retries: DEFAULT_STAGE_RETRIES,
            on_success: stage_names
                .get(index + 1)
                .map(|next| next.to_string())
                .unwrap_or_else(|| ROUTE_END.to_string()),
            on_failure: ON_FAILURE_FAIL.to_string(),
            config: serde_json::Value::Null,
        })
        .collect()
}

/// Built-in definition for workflows created without an explicit definition
/// id. Loaded at startup as first-class definitions.
pub fn legacy_definition(workflow_type: WorkflowType) -> WorkflowDefinition {
    let (name, stages) = match workflow_type {
        WorkflowType::App => (
            "legacy-app",
            chain(&[
                "planning",
                "architecture",
                "scaffold",
                "codegen",
                "validation",
                "testing",
                "deployment",
                "monitoring",
            ]),
        ),
        WorkflowType::Feature => (
            "legacy-feature",
            chain(&["planning", "scaffold", "codegen", "validation", "deployment"]),
        ),
        WorkflowType::Bugfix => ("legacy-bugfix", chain(&["scaffold", "validation", "deployment"])),
    };

    let now = Utc::now();
    WorkflowDefinition {
        id: Uuid::new_v4(),
        platform_id: None,
        name: name.to_string(),
        version: "1.0.0".to_string(),
        stages,
        metadata: serde_json::json!({ "legacy": true, "workflow_type": workflow_type.as_str() }),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(stages: Vec<StageDefinition>) -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            id: Uuid::new_v4(),
            platform_id: None,
            name: "test".to_string(),
            version: "1.0.0".to_string(),
            stages,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    fn stage(name: &str, on_success: &str, on_failure: &str) -> StageDefinition {
        StageDefinition {
            name: name.to_string(),
            agent_type: name.to_string(),
            timeout_ms: 1000,
            max_retries: 0,
            on_success: on_success.to_string(),
            on_failure: on_failure.to_string(),
            config: serde_json::Value::Null,
        }
    }

    #[test]
    fn first_stage_is_the_untargeted_one() {
        let d = def(vec![stage("a", "b", "fail"), stage("b", "END", "fail")]);
        assert_eq!(first_stage(&d).unwrap(), "a");
    }

    #[test]
    fn success_routes_to_named_stage_or_end() {
        let d = def(vec![stage("a", "b", "fail"), stage("b", "END", "fail")]);
        assert_eq!(next_stage(&d, "a", StageOutcome::Success).unwrap(), Route::Stage("b".into()));
        assert_eq!(next_stage(&d, "b", StageOutcome::Success).unwrap(), Route::End);
    }

    #[test]
    fn failure_fail_skip_and_jump() {
        let d = def(vec![
            stage("a", "b", "fail"),
            stage("b", "c", "skip"),
            stage("c", "END", "a"),
        ]);
        assert_eq!(next_stage(&d, "a", StageOutcome::Failure).unwrap(), Route::Fail);
        assert_eq!(next_stage(&d, "b", StageOutcome::Failure).unwrap(), Route::Stage("c".into()));
        assert_eq!(next_stage(&d, "c", StageOutcome::Failure).unwrap(), Route::Stage("a".into()));
    }

    #[test]
    fn skip_on_last_stage_ends_the_workflow() {
        let d = def(vec![stage("a", "b", "fail"), stage("b", "END", "skip")]);
        assert_eq!(next_stage(&d, "b", StageOutcome::Failure).unwrap(), Route::End);
    }

    #[test]
    fn unknown_stage_is_an_error() {
        let d = def(vec![stage("a", "END", "fail")]);
        assert!(next_stage(&d, "ghost", StageOutcome::Success).is_err());
    }

    #[test]
    fn progress_rounds_and_ignores_unknown_stages() {
        let d = def(vec![
            stage("a", "b", "fail"),
            stage("b", "c", "fail"),
            stage("c", "END", "fail"),
        ]);
        assert_eq!(calculate_progress(&d, &[]), 0);
        assert_eq!(calculate_progress(&d, &["a".into()]), 33);
        assert_eq!(calculate_progress(&d, &["a".into(), "b".into()]), 67);
        assert_eq!(calculate_progress(&d, &["a".into(), "b".into(), "c".into()]), 100);
        assert_eq!(calculate_progress(&d, &["ghost".into()]), 0);
    }

    #[test]
    fn validation_accepts_a_well_formed_definition() {
        let d = def(vec![stage("a", "b", "skip"), stage("b", "END", "fail")]);
        assert!(validate_definition(&d, |_| true).is_empty());
    }

    #[test]
    fn validation_rejects_cycles() {
        let d = def(vec![stage("a", "b", "fail"), stage("b", "a", "fail")]);
        let issues = validate_definition(&d, |_| true);
        assert!(issues.iter().any(|i| i.contains("cycle")));
    }

    #[test]
    fn validation_rejects_unknown_routing_targets() {
        let d = def(vec![stage("a", "ghost", "fail")]);
        let issues = validate_definition(&d, |_| true);
        assert!(issues.iter().any(|i| i.contains("unknown stage")));
    }

    #[test]
    fn validation_rejects_duplicate_names() {
        let d = def(vec![stage("a", "END", "fail"), stage("a", "END", "fail")]);
        let issues = validate_definition(&d, |_| true);
        assert!(issues.iter().any(|i| i.contains("duplicate")));
    }

    #[test]
    fn validation_rejects_unregistered_agents() {
        let d = def(vec![stage("a", "END", "fail")]);
        let issues = validate_definition(&d, |_| false);
        assert!(issues.iter().any(|i| i.contains("unregistered agent type")));
    }

    #[test]
    fn validation_rejects_empty_definitions() {
        let d = def(vec![]);
        let issues = validate_definition(&d, |_| true);
        assert!(issues.iter().any(|i| i.contains("at least one stage")));
    }

    #[test]
    fn validation_rejects_bad_semver() {
        let mut d = def(vec![stage("a", "END", "fail")]);
        d.version = "one".to_string();
        let issues = validate_definition(&d, |_| true);
        assert!(issues.iter().any(|i| i.contains("semver")));
    }

    #[test]
    fn legacy_definitions_have_expected_shapes() {
        assert_eq!(legacy_definition(WorkflowType::App).stages.len(), 8);
        assert_eq!(legacy_definition(WorkflowType::Feature).stages.len(), 5);

        let bugfix = legacy_definition(WorkflowType::Bugfix);
        assert_eq!(bugfix.stages.len(), 3);
        assert_eq!(
            bugfix.stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["scaffold", "validation", "deployment"]
        );
        assert!(validate_definition(&bugfix, |_| true).is_empty());
    }
}
