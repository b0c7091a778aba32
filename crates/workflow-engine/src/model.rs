//! Immutable value types describing a parsed workflow document.
//!
//! These are the in-memory data model the YAML parser (out of scope per
//! spec.md §1) produces; everything downstream — the matrix expander, the
//! DAG scheduler, the task executor — consumes these types only.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tasks are identified by a unique string within their workflow.
pub type TaskId = String;

/// A complete workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    /// -1 means unlimited.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: i64,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub docker: Option<DockerConfig>,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    #[serde(default)]
    pub watch: Option<WatchConfig>,
    /// Outbound webhook notification config. The notifier itself is an
    /// external collaborator (spec.md §1); the engine only carries the
    /// value through so the CLI layer can hand it off.
    #[serde(default)]
    pub webhooks: Option<serde_json::Value>,
    pub tasks: Vec<WorkflowTask>,
}

fn default_max_parallelism() -> i64 {
    -1
}

impl Workflow {
    /// Identifier used by the `workflow.id` expression (spec.md §4.3). No
    /// dedicated `id` key exists in the YAML root (spec.md §6); the engine
    /// resolves `workflow.id` to the workflow name, matching `workflow.name`.
    pub fn id(&self) -> &str {
        &self.name
    }

    pub fn get_task(&self, id: &str) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Structural validation: unique task ids and well-formed `DependsOn`
    /// edges (spec.md §3 invariants). This runs before matrix expansion;
    /// the deeper YAML schema validation is out of scope.
    pub fn validate_structure(&self) -> Result<(), crate::error::WorkflowError> {
        use crate::error::WorkflowError;
        use std::collections::HashSet;

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(WorkflowError::DuplicateTaskId(task.id.clone()));
            }
        }
        let ids: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        for task in &self.tasks {
            for dep in &task.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(WorkflowError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A single task in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    pub id: TaskId,
    pub run: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(rename = "if", default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub input: TaskInput,
    #[serde(default)]
    pub output: TaskOutputConfig,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    #[serde(default)]
    pub docker: Option<DockerConfig>,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    /// Populated only on matrix-expanded instances (spec.md §4.2); never
    /// parsed directly from the document.
    #[serde(default)]
    pub matrix_values: Option<HashMap<String, String>>,
}

impl WorkflowTask {
    /// Display name: falls back to `Id` (spec.md §3).
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Stdin payload source for a task (spec.md §3, §4.4 step 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskInput {
    None,
    Text { value: String },
    Bytes { value: String },
    File {
        #[serde(rename = "filePath")]
        file_path: String,
    },
    Pipe { value: String },
}

impl Default for TaskInput {
    fn default() -> Self {
        TaskInput::None
    }
}

/// How a task's output is captured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    String,
    Bytes,
    File,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutputConfig {
    #[serde(default = "default_output_kind")]
    pub kind: OutputKind,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default = "default_true")]
    pub capture_stderr: bool,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: usize,
}

fn default_output_kind() -> OutputKind {
    OutputKind::String
}

fn default_true() -> bool {
    true
}

/// Default cap on captured stdout/stderr bytes per task (spec.md §4.4 step 6).
pub fn default_max_size_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for TaskOutputConfig {
    fn default() -> Self {
        Self {
            kind: OutputKind::String,
            file_path: None,
            capture_stderr: true,
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

/// Matrix template: dimensions, extra includes, and exclusion filters
/// (spec.md §4.2).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MatrixConfig {
    pub dimensions: indexmap::IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub include: Vec<HashMap<String, String>>,
    #[serde(default)]
    pub exclude: Vec<HashMap<String, String>>,
}

/// Ambient-plus-override Docker execution config (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default = "default_true")]
    pub interactive: bool,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl DockerConfig {
    /// Task values win; unset fields fall back to `base` (spec.md §3).
    pub fn merge_with(&self, base: &DockerConfig) -> DockerConfig {
        DockerConfig {
            container: self.container.clone().or_else(|| base.container.clone()),
            user: self.user.clone().or_else(|| base.user.clone()),
            working_directory: self
                .working_directory
                .clone()
                .or_else(|| base.working_directory.clone()),
            interactive: self.interactive,
            tty: self.tty || base.tty,
            privileged: self.privileged || base.privileged,
            extra_args: if self.extra_args.is_empty() {
                base.extra_args.clone()
            } else {
                self.extra_args.clone()
            },
            disabled: self.disabled,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.disabled && self.container.as_deref().is_some_and(|c| !c.is_empty())
    }
}

/// Ambient-plus-override SSH execution config (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default = "default_true")]
    pub strict_host_key_checking: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u32,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

fn default_connect_timeout() -> u32 {
    10
}

impl SshConfig {
    pub fn merge_with(&self, base: &SshConfig) -> SshConfig {
        SshConfig {
            host: self.host.clone().or_else(|| base.host.clone()),
            user: self.user.clone().or_else(|| base.user.clone()),
            port: self.port.or(base.port),
            identity_file: self
                .identity_file
                .clone()
                .or_else(|| base.identity_file.clone()),
            strict_host_key_checking: self.strict_host_key_checking,
            connect_timeout_secs: self.connect_timeout_secs,
            extra_args: if self.extra_args.is_empty() {
                base.extra_args.clone()
            } else {
                self.extra_args.clone()
            },
            disabled: self.disabled,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.disabled
            && self.host.as_deref().is_some_and(|h| !h.is_empty())
            && self.user.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Filesystem watch configuration driving the file-change debouncer
/// (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_task_ids_rejected() {
        let wf = Workflow {
            name: "w".into(),
            description: None,
            environment: HashMap::new(),
            working_directory: None,
            default_timeout_ms: None,
            max_parallelism: -1,
            shell: None,
            docker: None,
            ssh: None,
            watch: None,
            webhooks: None,
            tasks: vec![
                WorkflowTask {
                    id: "a".into(),
                    run: "true".into(),
                    name: None,
                    shell: None,
                    working_directory: None,
                    environment: HashMap::new(),
                    condition: None,
                    input: TaskInput::None,
                    output: TaskOutputConfig::default(),
                    timeout_ms: None,
                    continue_on_error: false,
                    retry_count: 0,
                    retry_delay_ms: 0,
                    depends_on: vec![],
                    matrix: None,
                    docker: None,
                    ssh: None,
                    matrix_values: None,
                },
                WorkflowTask {
                    id: "a".into(),
                    run: "true".into(),
                    name: None,
                    shell: None,
                    working_directory: None,
                    environment: HashMap::new(),
                    condition: None,
                    input: TaskInput::None,
                    output: TaskOutputConfig::default(),
                    timeout_ms: None,
                    continue_on_error: false,
                    retry_count: 0,
                    retry_delay_ms: 0,
                    depends_on: vec![],
                    matrix: None,
                    docker: None,
                    ssh: None,
                    matrix_values: None,
                },
            ],
        };
        assert!(matches!(
            wf.validate_structure(),
            Err(crate::error::WorkflowError::DuplicateTaskId(_))
        ));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let wf = Workflow {
            name: "w".into(),
            description: None,
            environment: HashMap::new(),
            working_directory: None,
            default_timeout_ms: None,
            max_parallelism: -1,
            shell: None,
            docker: None,
            ssh: None,
            watch: None,
            webhooks: None,
            tasks: vec![WorkflowTask {
                id: "a".into(),
                run: "true".into(),
                name: None,
                shell: None,
                working_directory: None,
                environment: HashMap::new(),
                condition: None,
                input: TaskInput::None,
                output: TaskOutputConfig::default(),
                timeout_ms: None,
                continue_on_error: false,
                retry_count: 0,
                retry_delay_ms: 0,
                depends_on: vec!["missing".into()],
                matrix: None,
                docker: None,
                ssh: None,
                matrix_values: None,
            }],
        };
        assert!(matches!(
            wf.validate_structure(),
            Err(crate::error::WorkflowError::UnknownDependency { .. })
        ));
    }
}
