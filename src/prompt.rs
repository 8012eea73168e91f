//! Prompt construction.
//!
//! Templates may reference `{mode}`, `{os}` and `{python_version}`. Any other
//! `{placeholder}` is left untouched so user templates written for newer
//! versions keep working.

use crate::config::{Config, Mode, PromptFamily};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

const FALLBACK_PYTHON_VERSION: &str = "3";
const JUST_ANSWER_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const SNIPPET_HINT: &str = "Use a simple snippet with no functions if possible.";
const STRUCTURED_HINT: &str = "Use functions and call the entry function.";

/// How an existing file takes part in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// The reply is appended to the file.
    Append,
    /// The reply replaces the file.
    Edit,
}

/// An existing file supplied via `--append` or `--edit`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileContext {
    pub path: PathBuf,
    pub contents: String,
    pub action: FileAction,
}

impl FileContext {
    /// Reads `path` so the model can see it. A missing file reads as empty.
    pub fn load(path: &Path, action: FileAction) -> std::io::Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path: path.to_path_buf(),
            contents,
            action,
        })
    }
}

/// Runtime values available to templates.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub mode: Mode,
    pub os: String,
    pub python_version: String,
    pub file: Option<FileContext>,
}

impl PromptContext {
    pub fn new(mode: Mode, os: impl Into<String>, python_version: impl Into<String>) -> Self {
        Self {
            mode,
            os: os.into(),
            python_version: python_version.into(),
            file: None,
        }
    }

    pub fn with_file(mut self, file: FileContext) -> Self {
        self.file = Some(file);
        self
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "mode" => Some(self.mode.as_str()),
            "os" => Some(&self.os),
            "python_version" => Some(&self.python_version),
            _ => None,
        }
    }
}

/// Which flavour of prompt to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    Standard,
    Snippet,
    JustAnswer,
}

/// The rendered system and user messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Substitutes known `{name}` placeholders in a single left-to-right pass.
///
/// Substituted values are never re-scanned.
pub fn render(template: &str, context: &PromptContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(['{', '}']) {
            Some(close) if after.as_bytes()[close] == b'}' => {
                let name = &after[..close];
                match context.lookup(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Builds the messages sent to the model from the configured templates.
pub struct PromptBuilder<'a> {
    config: &'a Config,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn build(&self, task: &str, context: &PromptContext, style: PromptStyle) -> Prompt {
        let override_prompt = self.config.system_prompt_override.clone();

        if style == PromptStyle::JustAnswer {
            return Prompt {
                system: override_prompt.unwrap_or_else(|| JUST_ANSWER_SYSTEM_PROMPT.to_string()),
                user: task.to_string(),
            };
        }

        let family = self.family(context.mode);
        let system = match override_prompt {
            Some(system) => system,
            None => match family {
                Some(family) => self.system_prompt(family, context, style),
                None => String::new(),
            },
        };

        let mut user = match family {
            Some(family) => format!(
                "{}{}{}",
                render(&family.user_prefix, context),
                task,
                render(&family.user_suffix, context)
            ),
            None => task.to_string(),
        };

        if let Some(file) = &context.file {
            user.push_str(&file_section(file, context.mode));
        }

        debug!("[system] {}", system);
        debug!("[user]   {}", user);
        Prompt { system, user }
    }

    fn family(&self, mode: Mode) -> Option<&'a PromptFamily> {
        let templates = &self.config.prompt_templates;
        match mode {
            Mode::Python => Some(&templates.python),
            Mode::None => None,
            _ => Some(&templates.shell),
        }
    }

    fn system_prompt(&self, family: &PromptFamily, context: &PromptContext, style: PromptStyle) -> String {
        let rendered = render(&family.system, context);
        if context.mode != Mode::Python {
            return rendered;
        }
        let hint = if style == PromptStyle::Snippet {
            SNIPPET_HINT
        } else {
            STRUCTURED_HINT
        };
        if rendered.is_empty() {
            hint.to_string()
        } else {
            format!("{} {}", rendered.trim_end(), hint)
        }
    }
}

fn file_section(file: &FileContext, mode: Mode) -> String {
    let name = file
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.path.display().to_string());
    let instruction = match file.action {
        FileAction::Edit => "Rewrite this file to accomplish the task. Reply with the complete updated file only.",
        FileAction::Append => "Reply only with the code to append to the end of this file.",
    };
    let tag = if mode == Mode::None { "" } else { mode.as_str() };
    format!(
        "\n\nExisting file `{}`:\n```{}\n{}\n```\n{}",
        name,
        tag,
        file.contents.trim_end(),
        instruction
    )
}

/// Short OS description, e.g. `Linux / Ubuntu 24.04 LTS / x86_64`.
pub fn detect_os() -> String {
    let family = match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    };
    let mut parts = vec![family.to_string()];
    if family == "Linux" {
        if let Ok(release) = fs::read_to_string("/etc/os-release") {
            if let Some(pretty) = pretty_name(&release) {
                parts.push(pretty);
            }
        }
    }
    parts.push(std::env::consts::ARCH.to_string());
    parts.join(" / ")
}

fn pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `major.minor` of the local `python3`, or `3` if it cannot be determined.
pub fn detect_python_version() -> String {
    let Ok(python) = which::which("python3") else {
        return FALLBACK_PYTHON_VERSION.to_string();
    };
    Command::new(python)
        .arg("--version")
        .output()
        .ok()
        .and_then(|output| {
            // Older interpreters print the version on stderr.
            let text = if output.stdout.is_empty() {
                String::from_utf8_lossy(&output.stderr).to_string()
            } else {
                String::from_utf8_lossy(&output.stdout).to_string()
            };
            parse_python_version(&text)
        })
        .unwrap_or_else(|| FALLBACK_PYTHON_VERSION.to_string())
}

fn parse_python_version(text: &str) -> Option<String> {
    let version = text.trim().strip_prefix("Python ")?;
    let mut parts = version.split('.');
    let major = parts.next()?.trim();
    let minor = parts.next()?.trim();
    if major.chars().all(|c| c.is_ascii_digit()) && minor.chars().all(|c| c.is_ascii_digit()) {
        Some(format!("{}.{}", major, minor))
    } else {
        None
    }
}
