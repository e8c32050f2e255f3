//! Prompt template store.
//!
//! Prompts live outside the code as files under a prompt root, one `.md`
//! file per template. Templates use `{{var}}` substitution and may carry a
//! temporal directive that injects today's date and the default recent
//! window, so integrations can reference "the last N days" without every
//! call site recomputing dates.

use chrono::Utc;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Directive marker: when present anywhere in a template it is stripped and
/// a temporal-context block is prepended to the rendered output.
pub const TEMPORAL_DIRECTIVE: &str = "<!--@temporal-->";

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap())
}

/// Loads and renders prompt templates from a directory.
///
/// Rendering is a pure function of the template bytes, the variables, and
/// today's date: equal inputs on the same day yield byte-identical output.
#[derive(Debug, Clone)]
pub struct PromptStore {
    root: PathBuf,
    recent_window_days: i64,
}

impl PromptStore {
    pub fn new(root: impl Into<PathBuf>, recent_window_days: i64) -> Self {
        Self {
            root: root.into(),
            recent_window_days,
        }
    }

    /// Render the template `name` (relative path without the `.md` suffix)
    /// with the given variables.
    ///
    /// A missing template is a programming error and fails with
    /// [`Error::PromptNotFound`]. A `{{var}}` left unresolved fails with
    /// [`Error::PromptRender`] rather than producing a silently empty field.
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> Result<String> {
        let path = self.root.join(format!("{name}.md"));
        let template = std::fs::read_to_string(&path)
            .map_err(|_| Error::prompt_not_found(name))?;
        self.render_str(name, &template, vars)
    }

    /// Render already-loaded template text. Split out for tests.
    fn render_str(&self, name: &str, template: &str, vars: &[(&str, &str)]) -> Result<String> {
        let temporal = template.contains(TEMPORAL_DIRECTIVE);
        let mut body = template.replace(TEMPORAL_DIRECTIVE, "");

        for (key, value) in vars {
            body = body.replace(&format!("{{{{{key}}}}}"), value);
        }

        if let Some(unresolved) = placeholder_pattern().find(&body) {
            return Err(Error::prompt_render(
                name,
                format!("unresolved variable {}", unresolved.as_str()),
            ));
        }

        if temporal {
            Ok(format!("{}\n\n{}", self.temporal_block(), body.trim_start()))
        } else {
            Ok(body)
        }
    }

    /// The temporal-context block injected by the directive.
    pub fn temporal_block(&self) -> String {
        let today = Utc::now().date_naive();
        let window_start = today - chrono::Duration::days(self.recent_window_days);
        format!(
            "Temporal context: today is {} ({}). Unless the question specifies \
             otherwise, treat \"recent\" as the window {} to {} ({} days).",
            today,
            today.format("%A"),
            window_start,
            today,
            self.recent_window_days,
        )
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> PromptStore {
        PromptStore::new("prompts", 30)
    }

    #[test]
    fn test_substitution() {
        let out = store()
            .render_str("t", "Research {{topic}} in {{place}}.", &[
                ("topic", "contracts"),
                ("place", "Syria"),
            ])
            .unwrap();
        assert_eq!(out, "Research contracts in Syria.");
    }

    #[test]
    fn test_unresolved_variable_fails_loudly() {
        let err = store()
            .render_str("t", "Research {{topic}}.", &[])
            .unwrap_err();
        match err {
            Error::PromptRender { template, message } => {
                assert_eq!(template, "t");
                assert!(message.contains("{{topic}}"));
            }
            other => panic!("expected PromptRender, got {other:?}"),
        }
    }

    #[test]
    fn test_temporal_directive_prepends_context() {
        let out = store()
            .render_str("t", "<!--@temporal-->Find {{x}}.", &[("x", "filings")])
            .unwrap();
        assert!(out.starts_with("Temporal context: today is"));
        assert!(out.ends_with("Find filings."));
        assert!(!out.contains(TEMPORAL_DIRECTIVE));
    }

    #[test]
    fn test_render_is_deterministic_same_day() {
        let store = store();
        let a = store
            .render_str("t", "<!--@temporal-->{{q}}", &[("q", "same")])
            .unwrap();
        let b = store
            .render_str("t", "<!--@temporal-->{{q}}", &[("q", "same")])
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_template_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path(), 30);
        let err = store.render("nope", &[]).unwrap_err();
        assert!(matches!(err, Error::PromptNotFound { .. }));
    }

    #[test]
    fn test_render_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("greet.md"), "Hello {{name}}").unwrap();
        let store = PromptStore::new(dir.path(), 30);
        assert_eq!(store.render("greet", &[("name", "ada")]).unwrap(), "Hello ada");
    }
}
