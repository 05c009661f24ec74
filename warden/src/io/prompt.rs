//! Per-loop prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::types::ObservedError;

const LOOP_TEMPLATE: &str = include_str!("prompts/loop.md");

/// Line a worker prints to signal the task is finished.
pub const COMPLETION_MARKER: &str = "WARDEN_COMPLETE";

/// Inputs for one loop's prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    /// Task description from `.warden/PROMPT.md`.
    pub task: &'a str,
    pub repo: Option<&'a str>,
    pub loop_number: u32,
    pub hint: Option<&'a str>,
    pub previous_error: Option<&'a ObservedError>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("loop", LOOP_TEMPLATE)
            .context("load loop prompt template")?;
        Ok(Self { env })
    }

    pub fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("loop")?;
        let rendered = template
            .render(context! {
                task => input.task.trim(),
                repo => input.repo,
                loop_number => input.loop_number,
                hint => input.hint.map(str::trim).filter(|s| !s.is_empty()),
                previous_error => input.previous_error,
                completion_marker => COMPLETION_MARKER,
            })
            .context("render loop prompt")?;
        Ok(collapse_blank_lines(&rendered))
    }
}

/// Collapse runs of blank lines left behind by skipped template blocks.
fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.trim().lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}
