//! Built-in automation script templates.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

/// Template error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    UnknownTemplate(String),
    #[error("Missing template variable: {0}")]
    MissingVariable(String),
    #[error("Unterminated placeholder in: {0}")]
    Unterminated(String),
}

/// A named command sequence with `{variable}` placeholders.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub commands: &'static [&'static str],
    pub variables: &'static [&'static str],
}

const TEMPLATES: &[ScriptTemplate] = &[
    ScriptTemplate {
        name: "git-clone",
        description: "Clone a git repository",
        commands: &[
            "cd /workspace",
            "git clone {repository_url}",
            "cd {repository_name}",
            "ls -la",
        ],
        variables: &["repository_url", "repository_name"],
    },
    ScriptTemplate {
        name: "python-setup",
        description: "Setup Python virtual environment",
        commands: &[
            "cd /workspace",
            "python -m venv venv",
            "source venv/bin/activate",
            "pip install --upgrade pip",
            "pip install -r requirements.txt",
        ],
        variables: &[],
    },
    ScriptTemplate {
        name: "docker-build",
        description: "Build Docker image",
        commands: &[
            "cd /workspace",
            "docker build -t {image_name}:{tag} .",
            "docker images | grep {image_name}",
        ],
        variables: &["image_name", "tag"],
    },
];

/// Every built-in template.
#[must_use]
pub const fn builtin_templates() -> &'static [ScriptTemplate] {
    TEMPLATES
}

/// Look up a built-in template by name.
///
/// # Errors
/// Returns `UnknownTemplate` if no template has that name.
pub fn find_template(name: &str) -> Result<&'static ScriptTemplate, TemplateError> {
    TEMPLATES
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))
}

impl ScriptTemplate {
    /// Substitute `variables` into every command.
    ///
    /// `{{` and `}}` produce literal braces.
    ///
    /// # Errors
    /// Returns error if a placeholder has no value or is not closed.
    pub fn render(&self, variables: &HashMap<String, String>) -> Result<Vec<String>, TemplateError> {
        self.commands
            .iter()
            .map(|command| substitute(command, variables))
            .collect()
    }
}

fn substitute(template: &str, variables: &HashMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => return Err(TemplateError::Unterminated(template.to_string())),
                    }
                }
                let value = variables
                    .get(&name)
                    .ok_or(TemplateError::MissingVariable(name))?;
                out.push_str(value);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
