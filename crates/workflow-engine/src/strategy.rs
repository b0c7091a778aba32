//! Execution strategies: builds a concrete `(executable, args, cwd,
//! env_action)` tuple for Local / Docker / SSH (spec.md §4.4 step 4, §6
//! wire formats).

use crate::error::{WorkflowError, WorkflowResult};
use crate::model::{DockerConfig, SshConfig, Workflow, WorkflowTask};
use std::collections::HashMap;

/// What the process executor should do with the resolved environment map.
#[derive(Debug, Clone)]
pub enum EnvAction {
    /// Set these as the spawned process's environment (Local strategy).
    SetProcessEnv(HashMap<String, String>),
    /// The environment is already embedded in `args`/the remote command;
    /// the child process (`docker`/`ssh` itself) gets no extra env.
    None,
}

/// Output of `ExecutionStrategy::build_config`.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env_action: EnvAction,
}

pub trait ExecutionStrategy: Send + Sync {
    /// Lower runs first: SSH(10) → Docker(20) → Local(100).
    fn priority(&self) -> u32;
    fn can_handle(&self, workflow: &Workflow, task: &WorkflowTask) -> bool;
    fn build_config(
        &self,
        interpolated_cmd: &str,
        workflow: &Workflow,
        task: &WorkflowTask,
        env: &HashMap<String, String>,
    ) -> WorkflowResult<StrategyConfig>;
}

/// Task overrides workflow (spec.md §3 `MergeWith`).
pub fn effective_docker(workflow: &Workflow, task: &WorkflowTask) -> Option<DockerConfig> {
    match (&task.docker, &workflow.docker) {
        (Some(task_cfg), Some(base)) => Some(task_cfg.merge_with(base)),
        (Some(task_cfg), None) => Some(task_cfg.merge_with(&DockerConfig::default())),
        (None, base) => base.clone(),
    }
}

pub fn effective_ssh(workflow: &Workflow, task: &WorkflowTask) -> Option<SshConfig> {
    match (&task.ssh, &workflow.ssh) {
        (Some(task_cfg), Some(base)) => Some(task_cfg.merge_with(base)),
        (Some(task_cfg), None) => Some(task_cfg.merge_with(&SshConfig::default())),
        (None, base) => base.clone(),
    }
}

fn default_shell() -> &'static str {
    if cfg!(windows) {
        "cmd"
    } else {
        "bash"
    }
}

fn resolve_shell(workflow: &Workflow, task: &WorkflowTask) -> String {
    task.shell
        .clone()
        .or_else(|| workflow.shell.clone())
        .unwrap_or_else(|| default_shell().to_string())
}

fn shell_invocation_args(shell: &str, cmd: &str) -> Vec<String> {
    if shell.to_lowercase().contains("cmd") {
        vec!["/C".to_string(), cmd.to_string()]
    } else {
        vec!["-c".to_string(), cmd.to_string()]
    }
}

/// Escapes a value for embedding in a single-quoted POSIX shell token
/// (spec.md §6, §9 "Shell escaping for SSH").
fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Local execution: resolved shell (task > workflow > platform default)
/// invoked with its `-c`/`/C` argument template (spec.md §4.4 step 4).
pub struct LocalStrategy;

impl ExecutionStrategy for LocalStrategy {
    fn priority(&self) -> u32 {
        100
    }

    fn can_handle(&self, _workflow: &Workflow, _task: &WorkflowTask) -> bool {
        true
    }

    fn build_config(
        &self,
        interpolated_cmd: &str,
        workflow: &Workflow,
        task: &WorkflowTask,
        env: &HashMap<String, String>,
    ) -> WorkflowResult<StrategyConfig> {
        let shell = resolve_shell(workflow, task);
        let args = shell_invocation_args(&shell, interpolated_cmd);
        let cwd = task
            .working_directory
            .clone()
            .or_else(|| workflow.working_directory.clone());
        Ok(StrategyConfig {
            executable: shell,
            args,
            cwd,
            env_action: EnvAction::SetProcessEnv(env.clone()),
        })
    }
}

/// `docker exec` (spec.md §4.4 step 4, §6 wire format).
pub struct DockerStrategy;

impl ExecutionStrategy for DockerStrategy {
    fn priority(&self) -> u32 {
        20
    }

    fn can_handle(&self, workflow: &Workflow, task: &WorkflowTask) -> bool {
        effective_docker(workflow, task).is_some_and(|c| c.is_valid())
    }

    fn build_config(
        &self,
        interpolated_cmd: &str,
        workflow: &Workflow,
        task: &WorkflowTask,
        env: &HashMap<String, String>,
    ) -> WorkflowResult<StrategyConfig> {
        let config = effective_docker(workflow, task)
            .filter(|c| c.is_valid())
            .ok_or_else(|| {
                WorkflowError::InvalidRemoteConfig(
                    task.id.clone(),
                    "docker config missing or invalid container".to_string(),
                )
            })?;

        let shell = resolve_shell(workflow, task);
        let shell_args = shell_invocation_args(&shell, interpolated_cmd);

        let mut args = vec!["exec".to_string()];
        if config.interactive {
            args.push("-i".to_string());
        }
        if config.tty {
            args.push("-t".to_string());
        }
        if config.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(user) = &config.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        let cwd = task
            .working_directory
            .clone()
            .or_else(|| config.working_directory.clone());
        if let Some(wd) = &cwd {
            args.push("-w".to_string());
            args.push(wd.clone());
        }
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, env[key]));
        }
        args.extend(config.extra_args.iter().cloned());
        args.push(config.container.clone().unwrap_or_default());
        args.push(shell);
        args.extend(shell_args);

        Ok(StrategyConfig {
            executable: "docker".to_string(),
            args,
            cwd: None,
            env_action: EnvAction::None,
        })
    }
}

/// `ssh` (spec.md §4.4 step 4, §6 wire format, §9 shell escaping).
pub struct SshStrategy;

impl ExecutionStrategy for SshStrategy {
    fn priority(&self) -> u32 {
        10
    }

    fn can_handle(&self, workflow: &Workflow, task: &WorkflowTask) -> bool {
        effective_ssh(workflow, task).is_some_and(|c| c.is_valid())
    }

    fn build_config(
        &self,
        interpolated_cmd: &str,
        workflow: &Workflow,
        task: &WorkflowTask,
        env: &HashMap<String, String>,
    ) -> WorkflowResult<StrategyConfig> {
        let config = effective_ssh(workflow, task).filter(|c| c.is_valid()).ok_or_else(|| {
            WorkflowError::InvalidRemoteConfig(
                task.id.clone(),
                "ssh config missing host/user".to_string(),
            )
        })?;

        let shell = resolve_shell(workflow, task);
        let shell_args = shell_invocation_args(&shell, interpolated_cmd);
        let cwd = task
            .working_directory
            .clone()
            .or_else(|| workflow.working_directory.clone());

        let remote_cmd = build_remote_command(env, cwd.as_deref(), &shell, &shell_args);

        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", config.connect_timeout_secs),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                if config.strict_host_key_checking {
                    "yes"
                } else {
                    "no"
                }
            ),
        ];
        if let Some(identity) = &config.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        if let Some(port) = config.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.extend(config.extra_args.iter().cloned());
        args.push(format!(
            "{}@{}",
            config.user.clone().unwrap_or_default(),
            config.host.clone().unwrap_or_default()
        ));
        args.push(remote_cmd);

        Ok(StrategyConfig {
            executable: "ssh".to_string(),
            args,
            cwd: None,
            env_action: EnvAction::None,
        })
    }
}

fn build_remote_command(
    env: &HashMap<String, String>,
    cwd: Option<&str>,
    shell: &str,
    shell_args: &[String],
) -> String {
    let mut segments = Vec::new();

    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    for key in keys {
        segments.push(format!("export {}={}", key, shell_escape(&env[key])));
    }
    if let Some(wd) = cwd {
        segments.push(format!("cd {}", shell_escape(wd)));
    }

    let invocation = std::iter::once(shell.to_string())
        .chain(shell_args.iter().map(|a| shell_escape(a)))
        .collect::<Vec<_>>()
        .join(" ");
    segments.push(invocation);

    segments.join(" && ")
}

/// Returns the three strategies in their fixed priority order (spec.md
/// §4.4 step 4): SSH(10) → Docker(20) → Local(100).
pub fn default_strategies() -> Vec<Box<dyn ExecutionStrategy>> {
    vec![Box::new(SshStrategy), Box::new(DockerStrategy), Box::new(LocalStrategy)]
}

/// Select the first strategy (by ascending priority) whose `CanHandle`
/// returns true for this task. The local strategy always matches, so this
/// only fails if strategies were constructed without it (programmer error).
pub fn select_strategy<'a>(
    strategies: &'a [Box<dyn ExecutionStrategy>],
    workflow: &Workflow,
    task: &WorkflowTask,
) -> WorkflowResult<&'a dyn ExecutionStrategy> {
    let mut ordered: Vec<&Box<dyn ExecutionStrategy>> = strategies.iter().collect();
    ordered.sort_by_key(|s| s.priority());
    ordered
        .into_iter()
        .find(|s| s.can_handle(workflow, task))
        .map(|s| s.as_ref())
        .ok_or_else(|| WorkflowError::StrategyUnavailable(task.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskInput, TaskOutputConfig, WorkflowTask};
    use std::collections::HashMap as StdHashMap;

    fn workflow() -> Workflow {
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
            tasks: vec![],
        }
    }

    fn task() -> WorkflowTask {
        WorkflowTask {
            id: "t".into(),
            run: "echo hi".into(),
            name: None,
            shell: None,
            working_directory: None,
            environment: StdHashMap::new(),
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
        }
    }

    #[test]
    fn local_strategy_always_matches() {
        let strategies = default_strategies();
        let selected = select_strategy(&strategies, &workflow(), &task()).unwrap();
        assert_eq!(selected.priority(), 100);
    }

    #[test]
    fn ssh_wins_over_docker_and_local_when_valid() {
        let mut wf = workflow();
        let mut t = task();
        t.docker = Some(DockerConfig {
            container: Some("c".into()),
            ..Default::default()
        });
        t.ssh = Some(SshConfig {
            host: Some("h".into()),
            user: Some("u".into()),
            ..Default::default()
        });
        wf.tasks.push(t.clone());
        let strategies = default_strategies();
        let selected = select_strategy(&strategies, &wf, &t).unwrap();
        assert_eq!(selected.priority(), 10);
    }

    #[test]
    fn docker_build_config_matches_wire_format_order() {
        let wf = workflow();
        let mut t = task();
        t.docker = Some(DockerConfig {
            container: Some("mycontainer".into()),
            user: Some("root".into()),
            working_directory: Some("/app".into()),
            interactive: true,
            tty: true,
            privileged: true,
            extra_args: vec!["--rm".into()],
            disabled: false,
        });
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let config = DockerStrategy.build_config("echo hi", &wf, &t, &env).unwrap();
        assert_eq!(config.executable, "docker");
        assert_eq!(
            config.args,
            vec![
                "exec", "-i", "-t", "--privileged", "-u", "root", "-w", "/app", "-e",
                "FOO=bar", "--rm", "mycontainer", "bash", "-c", "echo hi"
            ]
        );
    }

    #[test]
    fn ssh_build_config_escapes_env_and_cwd() {
        let wf = workflow();
        let mut t = task();
        t.ssh = Some(SshConfig {
            host: Some("example.com".into()),
            user: Some("deploy".into()),
            port: Some(2222),
            identity_file: Some("/key".into()),
            strict_host_key_checking: false,
            connect_timeout_secs: 5,
            extra_args: vec![],
            disabled: false,
        });
        t.working_directory = Some("/app".into());
        let mut env = HashMap::new();
        env.insert("X".to_string(), "it's".to_string());
        let config = SshStrategy.build_config("echo hi", &wf, &t, &env).unwrap();
        assert_eq!(config.executable, "ssh");
        assert!(config.args.contains(&"ConnectTimeout=5".to_string()));
        assert!(config.args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(config.args.contains(&"-i".to_string()));
        assert!(config.args.contains(&"-p".to_string()));
        assert_eq!(config.args.last().unwrap(), "export X='it'\\''s' && cd '/app' && bash -c 'echo hi'");
        assert_eq!(config.args[config.args.len() - 2], "deploy@example.com");
    }
}
