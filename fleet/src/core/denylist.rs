//! Denylist matching for agent-proposed paths.
//!
//! Each pattern is tried against the full path, the basename, and every
//! containing directory (both the directory name and its path prefix). A
//! trailing `/` restricts a pattern to directories.

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};

/// Patterns denied by default: secrets, build artifacts, logs, IDE metadata.
pub const DEFAULT_DENYLIST: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "*.p12",
    "*.pfx",
    "id_rsa*",
    "id_ed25519*",
    "credentials.json",
    ".npmrc",
    ".pypirc",
    ".netrc",
    "*.log",
    "node_modules/",
    "target/",
    "dist/",
    "build/",
    "__pycache__/",
    "*.pyc",
    ".idea/",
    ".vscode/",
    ".DS_Store",
    "*.swp",
];

#[derive(Debug, Clone)]
struct Pattern {
    source: String,
    matcher: GlobMatcher,
    dir_only: bool,
}

/// Compiled denylist.
#[derive(Debug, Clone)]
pub struct Denylist {
    patterns: Vec<Pattern>,
}

impl Denylist {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let source = raw.as_ref().trim();
            if source.is_empty() {
                continue;
            }
            let dir_only = source.ends_with('/');
            let glob = source.trim_end_matches('/');
            let matcher = GlobBuilder::new(glob)
                .literal_separator(true)
                .build()
                .with_context(|| format!("invalid denylist pattern '{source}'"))?
                .compile_matcher();
            compiled.push(Pattern {
                source: source.to_string(),
                matcher,
                dir_only,
            });
        }
        Ok(Self { patterns: compiled })
    }

    pub fn default_patterns() -> Vec<String> {
        DEFAULT_DENYLIST.iter().map(|p| p.to_string()).collect()
    }

    /// Return the first pattern that denies `path`, if any.
    pub fn matches(&self, path: &str) -> Option<&str> {
        let normalized = normalize(path);
        let components: Vec<&str> = normalized.split('/').filter(|c| !c.is_empty()).collect();
        let Some((basename, dirs)) = components.split_last() else {
            return None;
        };

        for pattern in &self.patterns {
            if !pattern.dir_only
                && (pattern.matcher.is_match(&normalized) || pattern.matcher.is_match(basename))
            {
                return Some(&pattern.source);
            }
            for (idx, dir) in dirs.iter().enumerate() {
                let prefix = dirs[..=idx].join("/");
                if pattern.matcher.is_match(dir) || pattern.matcher.is_match(&prefix) {
                    return Some(&pattern.source);
                }
            }
        }
        None
    }
}

fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut trimmed = unified.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Denylist {
        Denylist::new(&Denylist::default_patterns()).expect("compile defaults")
    }

    #[test]
    fn basename_match_catches_nested_env_files() {
        let deny = defaults();
        assert_eq!(deny.matches(".env"), Some(".env"));
        assert_eq!(deny.matches("services/api/.env"), Some(".env"));
        assert_eq!(deny.matches("config/.env.production"), Some(".env.*"));
        assert_eq!(deny.matches("keys/server.pem"), Some("*.pem"));
    }

    #[test]
    fn directory_containment_match() {
        let deny = defaults();
        assert_eq!(
            deny.matches("web/node_modules/left-pad/index.js"),
            Some("node_modules/")
        );
        assert_eq!(deny.matches("./target/debug/app"), Some("target/"));
        assert_eq!(deny.matches(".vscode/settings.json"), Some(".vscode/"));
    }

    #[test]
    fn dir_only_patterns_do_not_match_files() {
        let deny = defaults();
        assert_eq!(deny.matches("docs/build"), None);
        assert_eq!(deny.matches("src/target.rs"), None);
    }

    #[test]
    fn full_path_patterns() {
        let deny = Denylist::new(&["secrets/*.json"]).expect("compile");
        assert_eq!(deny.matches("secrets/prod.json"), Some("secrets/*.json"));
        assert_eq!(deny.matches("other/secrets/prod.json"), None);
        assert_eq!(deny.matches("secrets/nested/prod.json"), None);
    }

    #[test]
    fn clean_paths_pass() {
        let deny = defaults();
        assert_eq!(deny.matches("src/main.rs"), None);
        assert_eq!(deny.matches("Cargo.toml"), None);
        assert_eq!(deny.matches("README.md"), None);
    }

    #[test]
    fn invalid_pattern_is_reported() {
        assert!(Denylist::new(&["a[b"]).is_err());
    }
}
