//! Planning instructions sent to the agent, rendered from templates.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::plan::{PLAN_BEGIN, PLAN_END};
use crate::core::types::{RepoTarget, TaskKind};

const COMMIT_TEMPLATE: &str = include_str!("prompts/commit.md");
const UPGRADE_TEMPLATE: &str = include_str!("prompts/upgrade.md");
const RELEASE_TEMPLATE: &str = include_str!("prompts/release.md");

/// Status lines beyond this are summarized as a count.
const MAX_CHANGES: usize = 200;

#[derive(Debug, Clone, Serialize)]
struct RepoContext {
    path: String,
    branch: String,
}

/// Inputs for the planning instruction.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub task: TaskKind,
    pub target: &'a RepoTarget,
    /// `git status --porcelain` lines, as `"XY path"`.
    pub changes: Vec<String>,
    pub latest_tag: Option<String>,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("commit", COMMIT_TEMPLATE)
            .expect("commit template should be valid");
        env.add_template("upgrade", UPGRADE_TEMPLATE)
            .expect("upgrade template should be valid");
        env.add_template("release", RELEASE_TEMPLATE)
            .expect("release template should be valid");
        Self { env }
    }

    fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let repo = RepoContext {
            path: input.target.path.display().to_string(),
            branch: input
                .target
                .branch
                .clone()
                .unwrap_or_else(|| "HEAD".to_string()),
        };
        let shown = input.changes.len().min(MAX_CHANGES);
        let template = self.env.get_template(input.task.as_str())?;
        let rendered = template.render(context! {
            repo => repo,
            changes => &input.changes[..shown],
            changes_truncated => input.changes.len() - shown,
            latest_tag => input.latest_tag.as_deref(),
            begin => PLAN_BEGIN,
            end => PLAN_END,
        })?;
        Ok(rendered)
    }
}

/// Render the planning instruction for one repository.
pub fn render_plan_prompt(input: &PromptInputs<'_>) -> Result<String> {
    let rendered = PromptEngine::new().render(input)?;
    debug!(task = input.task.as_str(), bytes = rendered.len(), "rendered plan prompt");
    Ok(rendered)
}
