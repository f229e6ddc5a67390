//! Prompt rendering for the system turn and per-step user turns.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{Primitive, SessionKey};
use crate::core::window::Content;
use crate::io::session::Observation;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const STEP_TEMPLATE: &str = include_str!("prompts/step.md");

#[derive(Debug, Clone, Serialize)]
struct PrimitiveDoc {
    name: &'static str,
    description: &'static str,
}

/// Inputs to the system turn.
#[derive(Debug, Clone)]
pub struct SystemPrompt<'a> {
    pub key: &'a SessionKey,
    pub instruction: &'a str,
    pub budget: u32,
}

/// Template engine wrapper around minijinja.
#[derive(Debug, Clone)]
pub struct PromptEngine {
    system_source: String,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self {
            system_source: SYSTEM_TEMPLATE.to_string(),
        }
    }
}

impl PromptEngine {
    /// Use the embedded system template unless an override path is given.
    pub fn new(system_override: Option<&Path>) -> Result<Self> {
        let Some(path) = system_override else {
            return Ok(Self::default());
        };
        let system_source = fs::read_to_string(path)
            .with_context(|| format!("read system template {}", path.display()))?;
        Environment::new()
            .template_from_str(&system_source)
            .with_context(|| format!("parse system template {}", path.display()))?;
        Ok(Self { system_source })
    }

    pub fn render_system(&self, input: &SystemPrompt<'_>) -> Result<String> {
        let primitives: Vec<PrimitiveDoc> = Primitive::EMITTABLE
            .iter()
            .map(|primitive| PrimitiveDoc {
                name: primitive.as_str(),
                description: primitive.describe(),
            })
            .collect();
        let rendered = Environment::new()
            .render_str(
                &self.system_source,
                context! {
                    kind => input.key.kind.as_str(),
                    sort => input.key.class.as_str(),
                    instruction => input.instruction.trim(),
                    budget => input.budget,
                    primitives => primitives,
                },
            )
            .context("render system prompt")?;
        Ok(rendered.trim().to_string())
    }

    /// Build the user turn contents for one prediction step (1-based `step`).
    pub fn step_contents(
        &self,
        step: u32,
        budget: u32,
        observation: &Observation,
    ) -> Result<Vec<Content>> {
        let text = Environment::new()
            .render_str(
                STEP_TEMPLATE,
                context! {
                    step => step,
                    budget => budget,
                    textual => observation.textual.as_deref().map(str::trim),
                    a11y_tree => observation.a11y_tree.as_deref().map(str::trim),
                    screenshot => observation.screenshot.is_some(),
                },
            )
            .context("render step prompt")?;
        let mut contents = vec![Content::text(text.trim())];
        if let Some(png) = &observation.screenshot {
            contents.push(Content::png(png));
        }
        Ok(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionClass;

    #[test]
    fn system_prompt_lists_instruction_and_signals() {
        let key = SessionKey::new("ChimeraX", SessionClass::Raw);
        let text = PromptEngine::default()
            .render_system(&SystemPrompt {
                key: &key,
                instruction: "  Color the model red. ",
                budget: 7,
            })
            .expect("render");
        assert!(text.contains("ChimeraX (Raw session)"));
        assert!(text.contains("Color the model red."));
        assert!(text.contains("7 turns"));
        assert!(text.contains("`DONE`"));
        assert!(text.contains("`WAIT`"));
        assert!(!text.contains("`TIMEOUT`"));
    }

    #[test]
    fn step_contents_include_requested_channels() {
        let observation = Observation {
            textual: Some("opened demo".to_string()),
            screenshot: Some(vec![1, 2, 3]),
            a11y_tree: None,
        };
        let contents = PromptEngine::default()
            .step_contents(2, 5, &observation)
            .expect("contents");
        assert_eq!(contents.len(), 2);
        let Content::Text { text } = &contents[0] else {
            panic!("first part should be text");
        };
        assert!(text.starts_with("Turn 2 of 5."));
        assert!(text.contains("opened demo"));
        assert!(text.contains("screenshot"));
        assert!(!text.contains("Accessibility tree"));
        assert!(matches!(contents[1], Content::ImageUrl { .. }));
    }

    #[test]
    fn empty_textual_output_is_marked() {
        let observation = Observation {
            textual: Some(String::new()),
            ..Observation::default()
        };
        let contents = PromptEngine::default()
            .step_contents(1, 1, &observation)
            .expect("contents");
        let Content::Text { text } = &contents[0] else {
            panic!("text part");
        };
        assert!(text.contains("(no output)"));
    }

    #[test]
    fn override_template_must_parse() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("system.md");
        fs::write(&path, "Operate {{ kind }}: {{ instruction }}").expect("write");
        let engine = PromptEngine::new(Some(&path)).expect("engine");
        let key = SessionKey::new("Lean", SessionClass::Vm);
        let text = engine
            .render_system(&SystemPrompt {
                key: &key,
                instruction: "prove it",
                budget: 1,
            })
            .expect("render");
        assert_eq!(text, "Operate Lean: prove it");

        fs::write(&path, "{% if %}").expect("write");
        assert!(PromptEngine::new(Some(&path)).is_err());
        assert!(PromptEngine::new(Some(&temp.path().join("missing.md"))).is_err());
    }
}
