//! Dispatcher (spec.md §4.7): resolves rule parameters through the
//! template resolver, then delegates to the workflow runner via a
//! schedule-runner facade, returning the `runId`.

use crate::error::{TriggerError, TriggerResult};
use crate::model::MatchResult;
use crate::template;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use workflow_engine::{run_workflow, Workflow, WorkflowRunOptions};

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, matched: &MatchResult) -> TriggerResult<String>;
}

/// Resolves the rule's workflow file and runs it through the engine
/// directly. A deployment wiring a cron daemon in front of the same
/// workflows can instead implement [`Dispatcher`] against that daemon's
/// `TriggerSchedule` entry point; this is the facade's default.
pub struct WorkflowDispatcher;

#[async_trait]
impl Dispatcher for WorkflowDispatcher {
    async fn dispatch(&self, matched: &MatchResult) -> TriggerResult<String> {
        let contents = tokio::fs::read_to_string(Path::new(&matched.rule.workflow_path))
            .await
            .map_err(|e| TriggerError::WorkflowFile(format!("{}: {e}", matched.rule.workflow_path)))?;
        let workflow: Workflow = serde_yaml::from_str(&contents)?;

        let mut parameters: HashMap<String, String> = HashMap::new();
        parameters.extend(matched.captures.clone());
        if let Some(text) = matched.message.well_known_field("text") {
            parameters.insert("trigger_text".to_string(), text);
        }

        let options = WorkflowRunOptions {
            parameters,
            ..Default::default()
        };

        let ctx = run_workflow(
            workflow,
            std::env::vars().collect(),
            options,
            tokio_util::sync::CancellationToken::new(),
            None,
        )
        .await?;

        Ok(ctx.run_id.clone())
    }
}

/// Renders the rule's `ResponseTemplate`, if any, against the match.
pub fn render_response(matched: &MatchResult) -> Option<String> {
    matched.rule.response_template.as_ref().map(|tpl| {
        template::resolve(
            tpl,
            &matched.captures,
            &matched.message,
            &matched.rule.extra_template_values,
        )
    })
}
