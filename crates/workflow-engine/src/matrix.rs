//! Matrix expansion: replaces a templated task with the cross-product of
//! its dimensions (plus include, minus exclude) and rewrites dependency
//! edges accordingly (spec.md §4.2).

use crate::model::{TaskId, WorkflowTask};
use std::collections::{HashMap, HashSet};

struct MatrixExpansion {
    expanded_ids: Vec<TaskId>,
    values: HashMap<TaskId, HashMap<String, String>>,
    dimension_keys: HashSet<String>,
}

/// Expand every matrix task in `tasks` and rewrite dependency edges
/// (spec.md §4.2). Tasks without a `Matrix` pass through unchanged except
/// for dependency rewriting when they depend on an expanded task.
pub fn expand_matrices(tasks: Vec<WorkflowTask>) -> Vec<WorkflowTask> {
    let mut expansions: HashMap<String, MatrixExpansion> = HashMap::new();
    let mut output: Vec<WorkflowTask> = Vec::new();

    for task in &tasks {
        let Some(matrix) = &task.matrix else {
            continue;
        };
        let dimension_keys: Vec<String> = matrix.dimensions.keys().cloned().collect();
        let combos = generate_combinations(matrix);

        let mut expanded_ids = Vec::new();
        let mut values = HashMap::new();
        for combo in combos {
            let id = materialize_id(&task.id, &dimension_keys, &combo);
            expanded_ids.push(id.clone());
            values.insert(id, combo);
        }

        expansions.insert(
            task.id.clone(),
            MatrixExpansion {
                expanded_ids,
                values,
                dimension_keys: dimension_keys.into_iter().collect(),
            },
        );
    }

    for task in &tasks {
        if let Some(expansion) = expansions.get(&task.id) {
            for expanded_id in &expansion.expanded_ids {
                let combo = &expansion.values[expanded_id];
                output.push(materialize_task(task, expanded_id.clone(), combo.clone()));
            }
        } else {
            output.push(task.clone());
        }
    }

    for task in &mut output {
        task.depends_on = rewrite_dependencies(task, &expansions);
    }

    output
}

fn generate_combinations(
    matrix: &crate::model::MatrixConfig,
) -> Vec<HashMap<String, String>> {
    let mut combos: Vec<HashMap<String, String>> = vec![HashMap::new()];
    for (key, values) in &matrix.dimensions {
        let mut next = Vec::with_capacity(combos.len() * values.len().max(1));
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(key.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }

    combos.extend(matrix.include.iter().cloned());

    combos
        .into_iter()
        .filter(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| is_superset_match(combo, exclude))
        })
        .collect()
}

/// True if `combo` contains every key/value pair in `exclude` (spec.md §4.2
/// step 1: "superset-matched").
fn is_superset_match(combo: &HashMap<String, String>, exclude: &HashMap<String, String>) -> bool {
    exclude
        .iter()
        .all(|(k, v)| combo.get(k).map(|cv| cv == v).unwrap_or(false))
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn materialize_id(base: &str, dimension_keys: &[String], combo: &HashMap<String, String>) -> TaskId {
    let mut id = base.to_string();
    for key in dimension_keys {
        if let Some(value) = combo.get(key) {
            id.push('-');
            id.push_str(&sanitize(value));
        }
    }
    id
}

fn materialize_task(base: &WorkflowTask, id: TaskId, combo: HashMap<String, String>) -> WorkflowTask {
    let mut task = base.clone();
    task.id = id.clone();
    task.name = task.name.map(|n| interpolate_matrix(&n, &combo));
    task.run = interpolate_matrix(&task.run, &combo);
    task.condition = task.condition.map(|c| interpolate_matrix(&c, &combo));
    for value in task.environment.values_mut() {
        *value = interpolate_matrix(value, &combo);
    }
    task.input = interpolate_input(task.input, &combo);
    task.matrix = None;
    task.matrix_values = Some(combo);
    task
}

fn interpolate_input(input: crate::model::TaskInput, combo: &HashMap<String, String>) -> crate::model::TaskInput {
    use crate::model::TaskInput;
    match input {
        TaskInput::None => TaskInput::None,
        TaskInput::Text { value } => TaskInput::Text {
            value: interpolate_matrix(&value, combo),
        },
        TaskInput::Bytes { value } => TaskInput::Bytes {
            value: interpolate_matrix(&value, combo),
        },
        TaskInput::File { file_path } => TaskInput::File {
            file_path: interpolate_matrix(&file_path, combo),
        },
        TaskInput::Pipe { value } => TaskInput::Pipe {
            value: interpolate_matrix(&value, combo),
        },
    }
}

/// Literal substitution of `${{ matrix.<key> }}` only (spec.md §4.2 step 2)
/// — unlike the general expression engine, this never touches `env.*`,
/// `tasks.*` etc., which are resolved later at task-executor time.
fn interpolate_matrix(s: &str, combo: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    loop {
        match rest.find("${{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                let after_open = &rest[start + 3..];
                match after_open.find("}}") {
                    None => {
                        out.push_str(&rest[..start]);
                        out.push_str(&rest[start..]);
                        break;
                    }
                    Some(end) => {
                        let inner = after_open[..end].trim();
                        out.push_str(&rest[..start]);
                        if let Some(key) = inner.strip_prefix("matrix.") {
                            if let Some(value) = combo.get(key.trim()) {
                                out.push_str(value);
                            } else {
                                out.push_str(&rest[start..start + 3 + end + 2]);
                            }
                        } else {
                            out.push_str(&rest[start..start + 3 + end + 2]);
                        }
                        rest = &after_open[end + 2..];
                    }
                }
            }
        }
    }
    out
}

fn rewrite_dependencies(
    task: &WorkflowTask,
    expansions: &HashMap<String, MatrixExpansion>,
) -> Vec<TaskId> {
    let own_keys: Option<&HashMap<String, String>> = task.matrix_values.as_ref();
    let mut rewritten = Vec::new();

    for dep in &task.depends_on {
        match expansions.get(dep) {
            None => rewritten.push(dep.clone()),
            Some(expansion) => {
                let shared_keys: HashSet<&String> = match own_keys {
                    Some(values) => values
                        .keys()
                        .filter(|k| expansion.dimension_keys.contains(*k))
                        .collect(),
                    None => HashSet::new(),
                };

                if let Some(own_values) = own_keys {
                    if !shared_keys.is_empty() {
                        for expanded_id in &expansion.expanded_ids {
                            let candidate = &expansion.values[expanded_id];
                            if shared_keys
                                .iter()
                                .all(|k| candidate.get(*k) == own_values.get(*k))
                            {
                                rewritten.push(expanded_id.clone());
                            }
                        }
                        continue;
                    }
                }

                rewritten.extend(expansion.expanded_ids.iter().cloned());
            }
        }
    }

    rewritten
}
