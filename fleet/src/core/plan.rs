//! Agent plan model, sentinel extraction, and structural validation.
//!
//! Plans are untrusted input. Extraction only finds the delimited block and
//! parses it as JSON; [`parse_plan`] enforces the schema and path rules before
//! any typed [`AgentPlan`] exists.

use std::path::{Component, Path};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PLAN_BEGIN: &str = "<<<FLEET_PLAN_BEGIN>>>";
pub const PLAN_END: &str = "<<<FLEET_PLAN_END>>>";

const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/plan.schema.json"
));

/// Operation on one file in a commit plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOpKind {
    /// Stage the working-tree content of the path.
    Stage,
    /// Stage the deletion of the path.
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
    pub path: String,
    pub op: FileOpKind,
}

/// The mutation an agent proposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PlanAction {
    Commit { message: String, files: Vec<FileOp> },
    Release { tag: String, message: String },
}

/// A schema-checked plan. Still untrusted until the guardrails pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPlan {
    pub schema_version: u32,
    #[serde(flatten)]
    pub action: PlanAction,
    #[serde(default)]
    pub rationale: String,
}

impl AgentPlan {
    /// Files referenced by the plan (empty for releases).
    pub fn files(&self) -> &[FileOp] {
        match &self.action {
            PlanAction::Commit { files, .. } => files,
            PlanAction::Release { .. } => &[],
        }
    }

    pub fn message(&self) -> &str {
        match &self.action {
            PlanAction::Commit { message, .. } | PlanAction::Release { message, .. } => message,
        }
    }

    /// Keep only files for which `keep` returns true. Returns the removed paths.
    pub fn retain_files(&mut self, mut keep: impl FnMut(&FileOp) -> bool) -> Vec<String> {
        let mut removed = Vec::new();
        if let PlanAction::Commit { files, .. } = &mut self.action {
            files.retain(|op| {
                let k = keep(op);
                if !k {
                    removed.push(op.path.clone());
                }
                k
            });
        }
        removed
    }
}

/// Result of scanning a transcript for the delimited plan block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(String),
    Missing,
    /// Several blocks with differing content.
    Ambiguous(usize),
}

/// Find the single plan block between sentinel lines.
///
/// A sentinel line may carry a non-alphanumeric prefix (terminal bullets,
/// box drawing) but nothing else. Identical repeated blocks, as produced by
/// terminal redraws, collapse into one.
pub fn extract_plan_block(transcript: &str) -> Extraction {
    let mut blocks: Vec<String> = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in transcript.lines() {
        if is_sentinel(line, PLAN_BEGIN) {
            current = Some(Vec::new());
            continue;
        }
        if is_sentinel(line, PLAN_END) {
            if let Some(lines) = current.take() {
                let block = lines.join("\n").trim().to_string();
                if !blocks.contains(&block) {
                    blocks.push(block);
                }
            }
            continue;
        }
        if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }

    match blocks.len() {
        0 => Extraction::Missing,
        1 => Extraction::Found(blocks.remove(0)),
        n => Extraction::Ambiguous(n),
    }
}

pub(crate) fn is_sentinel(line: &str, sentinel: &str) -> bool {
    let trimmed = line.trim();
    match trimmed.strip_suffix(sentinel) {
        Some(prefix) => !prefix.chars().any(char::is_alphanumeric),
        None => false,
    }
}

/// Parse the delimited block as JSON. Structure is not checked here.
pub fn parse_block(block: &str) -> Result<Value> {
    serde_json::from_str(block).context("plan block is not valid JSON")
}

/// Validate a raw plan against the plan schema and path rules.
///
/// Returns the typed plan, or every violation found.
pub fn parse_plan(raw: &Value) -> Result<AgentPlan, Vec<String>> {
    let validator = plan_validator().map_err(|err| vec![format!("{err:#}")])?;
    let mut errors: Vec<String> = validator.iter_errors(raw).map(|e| e.to_string()).collect();
    if !errors.is_empty() {
        return Err(errors);
    }
    let plan: AgentPlan =
        serde_json::from_value(raw.clone()).map_err(|err| vec![format!("deserialize plan: {err}")])?;

    if plan.message().trim().is_empty() {
        errors.push("message must not be blank".to_string());
    }
    for op in plan.files() {
        if let Err(err) = validate_plan_path(&op.path) {
            errors.push(err);
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(plan)
}

fn plan_validator() -> Result<jsonschema::Validator> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    jsonschema::validator_for(&schema).map_err(|err| anyhow!("invalid plan schema: {err}"))
}

/// Paths must be relative, stay inside the worktree, and avoid `.git`.
pub fn validate_plan_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("empty path".to_string());
    }
    if path.contains('\0') {
        return Err(format!("path contains NUL: {path:?}"));
    }
    if path.starts_with('/') || path.starts_with('\\') || has_drive_prefix(path) {
        return Err(format!("absolute path not allowed: {path}"));
    }
    let mut first = true;
    for component in Path::new(path).components() {
        match component {
            Component::ParentDir => return Err(format!("path escapes worktree: {path}")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("absolute path not allowed: {path}"));
            }
            Component::Normal(name) => {
                if first && name == ".git" {
                    return Err(format!("path points into .git: {path}"));
                }
                first = false;
            }
            Component::CurDir => {}
        }
    }
    Ok(())
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wrap(body: &str) -> String {
        format!("thinking...\n{PLAN_BEGIN}\n{body}\n{PLAN_END}\ndone\n")
    }

    #[test]
    fn extracts_single_block_and_ignores_prose() {
        let transcript = wrap(r#"{"a": 1}"#);
        assert_eq!(
            extract_plan_block(&transcript),
            Extraction::Found(r#"{"a": 1}"#.to_string())
        );
    }

    #[test]
    fn sentinel_mentioned_inline_is_not_a_block() {
        let transcript = format!("Wrap the plan between {PLAN_BEGIN} and {PLAN_END} lines.\n");
        assert_eq!(extract_plan_block(&transcript), Extraction::Missing);
    }

    #[test]
    fn tolerates_terminal_bullets_and_redraws() {
        let block = format!("⏺ {PLAN_BEGIN}\n  {{\"a\": 1}}\n  {PLAN_END}\n");
        let transcript = format!("{block}{block}");
        assert_eq!(
            extract_plan_block(&transcript),
            Extraction::Found("{\"a\": 1}".to_string())
        );
    }

    #[test]
    fn differing_blocks_are_ambiguous() {
        let transcript = format!("{}{}", wrap("{}"), wrap(r#"{"b": 2}"#));
        assert_eq!(extract_plan_block(&transcript), Extraction::Ambiguous(2));
    }

    #[test]
    fn unterminated_block_is_missing() {
        let transcript = format!("{PLAN_BEGIN}\n{{}}\n");
        assert_eq!(extract_plan_block(&transcript), Extraction::Missing);
    }

    #[test]
    fn parses_commit_plan() {
        let raw = json!({
            "schema_version": 1,
            "action": "commit",
            "message": "fix: handle empty input",
            "files": [{"path": "src/lib.rs", "op": "stage"}],
            "rationale": "bug fix"
        });
        let plan = parse_plan(&raw).expect("valid plan");
        assert_eq!(plan.files().len(), 1);
        assert_eq!(plan.message(), "fix: handle empty input");
    }

    #[test]
    fn parses_release_plan() {
        let raw = json!({
            "schema_version": 1,
            "action": "release",
            "tag": "v1.2.0",
            "message": "Release 1.2.0"
        });
        let plan = parse_plan(&raw).expect("valid plan");
        assert!(matches!(plan.action, PlanAction::Release { ref tag, .. } if tag == "v1.2.0"));
        assert!(plan.files().is_empty());
    }

    #[test]
    fn rejects_empty_files_and_blank_message() {
        let empty_files = json!({
            "schema_version": 1,
            "action": "commit",
            "message": "x",
            "files": []
        });
        assert!(parse_plan(&empty_files).is_err());

        let blank = json!({
            "schema_version": 1,
            "action": "commit",
            "message": "   ",
            "files": [{"path": "a", "op": "stage"}]
        });
        assert!(parse_plan(&blank).is_err());
    }

    #[test]
    fn rejects_unknown_fields_and_wrong_version() {
        let raw = json!({
            "schema_version": 2,
            "action": "commit",
            "message": "x",
            "files": [{"path": "a", "op": "stage"}],
            "shell": "rm -rf /"
        });
        let errors = parse_plan(&raw).unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn path_rules_reject_escapes() {
        assert!(validate_plan_path("src/main.rs").is_ok());
        assert!(validate_plan_path("./src/main.rs").is_ok());
        assert!(validate_plan_path("../other/file").is_err());
        assert!(validate_plan_path("src/../../x").is_err());
        assert!(validate_plan_path("/etc/passwd").is_err());
        assert!(validate_plan_path("C:\\x").is_err());
        assert!(validate_plan_path(".git/config").is_err());
        assert!(validate_plan_path("./.git/hooks/pre-commit").is_err());
        assert!(validate_plan_path("docs/.github/x").is_ok());
    }

    #[test]
    fn retain_files_reports_removed_paths() {
        let mut plan = parse_plan(&json!({
            "schema_version": 1,
            "action": "commit",
            "message": "x",
            "files": [{"path": ".env", "op": "stage"}, {"path": "a.rs", "op": "stage"}]
        }))
        .expect("plan");
        let removed = plan.retain_files(|op| op.path != ".env");
        assert_eq!(removed, vec![".env".to_string()]);
        assert_eq!(plan.files().len(), 1);
    }
}
