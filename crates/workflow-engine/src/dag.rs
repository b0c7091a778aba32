//! Wave-based DAG scheduler (spec.md §4.1).
//!
//! Input is a `Workflow` with matrices already expanded; output is an
//! `ExecutionPlan` of waves plus a terminal `always()` wave.

use crate::error::{WorkflowError, WorkflowResult};
use crate::model::{TaskId, Workflow};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{HashMap, HashSet};

/// A maximal set of tasks whose regular dependencies all lie in earlier
/// waves; members may run concurrently (GLOSSARY).
pub type Wave = Vec<TaskId>;

/// Output of the DAG scheduler (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub waves: Vec<Wave>,
    pub always_tasks: Vec<TaskId>,
}

impl ExecutionPlan {
    pub fn total_tasks(&self) -> usize {
        self.waves.iter().map(|w| w.len()).sum::<usize>() + self.always_tasks.len()
    }
}

/// A task's `If` mentions the `always()` status function (spec.md §4.1).
/// Textual detection is sufficient: `always()` only has meaning as a
/// zero-arg status function call, never as a substring of another
/// identifier in valid workflow YAML.
fn is_always_task(condition: Option<&str>) -> bool {
    condition.is_some_and(|c| c.contains("always()"))
}

/// Build the `ExecutionPlan` for a workflow (spec.md §4.1).
pub fn plan_workflow(workflow: &Workflow) -> WorkflowResult<ExecutionPlan> {
    let all_ids: HashSet<&str> = workflow.tasks.iter().map(|t| t.id.as_str()).collect();
    for task in &workflow.tasks {
        for dep in &task.depends_on {
            if !all_ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut always_tasks = Vec::new();
    let mut regular: Vec<&str> = Vec::new();
    for task in &workflow.tasks {
        if is_always_task(task.condition.as_deref()) {
            always_tasks.push(task.id.clone());
        } else {
            regular.push(task.id.as_str());
        }
    }
    let regular_set: HashSet<&str> = regular.iter().copied().collect();

    // Dependencies restricted to the regular set; deps on always-tasks are
    // ignored for wave placement (spec.md §4.1).
    let mut remaining_deps: HashMap<&str, HashSet<&str>> = HashMap::new();
    for task in &workflow.tasks {
        if !regular_set.contains(task.id.as_str()) {
            continue;
        }
        let deps: HashSet<&str> = task
            .depends_on
            .iter()
            .map(|d| d.as_str())
            .filter(|d| regular_set.contains(d))
            .collect();
        remaining_deps.insert(task.id.as_str(), deps);
    }

    cross_check_acyclic(&regular, &remaining_deps)?;

    let mut placed: HashSet<&str> = HashSet::new();
    let mut waves: Vec<Wave> = Vec::new();

    while placed.len() < regular.len() {
        let wave: Vec<&str> = regular
            .iter()
            .copied()
            .filter(|id| {
                !placed.contains(id)
                    && remaining_deps[id].iter().all(|d| placed.contains(d))
            })
            .collect();

        if wave.is_empty() {
            let stuck: Vec<String> = regular
                .iter()
                .filter(|id| !placed.contains(*id))
                .map(|id| id.to_string())
                .collect();
            return Err(WorkflowError::CircularDependency(stuck));
        }

        for id in &wave {
            placed.insert(id);
        }
        waves.push(wave.into_iter().map(|s| s.to_string()).collect());
    }

    Ok(ExecutionPlan {
        waves,
        always_tasks,
    })
}

/// Secondary cycle check via `petgraph::algo::toposort`, cross-validating
/// the hand-rolled Kahn stripping above.
fn cross_check_acyclic(
    ids: &[&str],
    deps: &HashMap<&str, HashSet<&str>>,
) -> WorkflowResult<()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut nodes = HashMap::new();
    for id in ids {
        nodes.insert(*id, graph.add_node(*id));
    }
    for (id, dependencies) in deps {
        for dep in dependencies {
            graph.add_edge(nodes[dep], nodes[id], ());
        }
    }
    if toposort(&graph, None).is_err() {
        let stuck: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        return Err(WorkflowError::CircularDependency(stuck));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskOutputConfig, WorkflowTask};
    use std::collections::HashMap as StdHashMap;

    fn task(id: &str, depends_on: Vec<&str>, condition: Option<&str>) -> WorkflowTask {
        WorkflowTask {
            id: id.to_string(),
            run: "true".to_string(),
            name: None,
            shell: None,
            working_directory: None,
            environment: StdHashMap::new(),
            condition: condition.map(|s| s.to_string()),
            input: Default::default(),
            output: TaskOutputConfig::default(),
            timeout_ms: None,
            continue_on_error: false,
            retry_count: 0,
            retry_delay_ms: 0,
            depends_on: depends_on.into_iter().map(|s| s.to_string()).collect(),
            matrix: None,
            docker: None,
            ssh: None,
            matrix_values: None,
        }
    }

    fn workflow(tasks: Vec<WorkflowTask>) -> Workflow {
        Workflow {
            name: "w".into(),
            description: None,
            environment: StdHashMap::new(),
            working_directory: None,
            default_timeout_ms: None,
            max_parallelism: -1,
            shell: None,
            docker: None,
            ssh: None,
            watch: None,
            webhooks: None,
            tasks,
        }
    }

    #[test]
    fn diamond_dag_produces_three_waves() {
        let wf = workflow(vec![
            task("a", vec![], None),
            task("b", vec!["a"], None),
            task("c", vec!["a"], None),
            task("d", vec!["b", "c"], None),
        ]);
        let plan = plan_workflow(&wf).unwrap();
        assert_eq!(plan.waves.len(), 3);
        assert_eq!(plan.waves[0], vec!["a".to_string()]);
        let mut wave1 = plan.waves[1].clone();
        wave1.sort();
        assert_eq!(wave1, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(plan.waves[2], vec!["d".to_string()]);
        assert!(plan.always_tasks.is_empty());
        assert_eq!(plan.total_tasks(), 4);
    }

    #[test]
    fn cycle_is_rejected() {
        let wf = workflow(vec![task("a", vec!["b"], None), task("b", vec!["a"], None)]);
        let err = plan_workflow(&wf).unwrap_err();
        assert!(matches!(err, WorkflowError::CircularDependency(_)));
    }

    #[test]
    fn always_task_excluded_from_waves() {
        let wf = workflow(vec![
            task("a", vec![], None),
            task("cleanup", vec!["a"], Some("${{ always() }}")),
        ]);
        let plan = plan_workflow(&wf).unwrap();
        assert_eq!(plan.waves, vec![vec!["a".to_string()]]);
        assert_eq!(plan.always_tasks, vec!["cleanup".to_string()]);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let wf = workflow(vec![task("a", vec!["missing"], None)]);
        let err = plan_workflow(&wf).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency { .. }));
    }
}
