//! Routes a classified reply to its destination.
//!
//! One-liners go to the hand-off file read by the shell wrapper. Scripts are
//! saved under `{output_dir}/{YYYYMMDD}/` and the command that runs them is
//! handed off instead. Nothing is ever executed here.
//!
//! All file writes go through a temporary file in the destination directory
//! followed by a rename, so a failed write never leaves a truncated file.

use crate::classifier::ClassifiedResult;
use crate::clipboard;
use crate::config::{Config, Mode};
use crate::error::ShellmandoError;
use crate::prompt::{FileAction, FileContext};
use crate::providers::{SystemTimeProvider, TimeProvider};
use chrono::{DateTime, Local};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

const RULE_WIDTH: usize = 72;

/// What the router did, which also decides the exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A one-liner is ready at the hand-off file.
    OneLiner,
    /// A script was written; its invocation is at the hand-off file.
    ScriptSaved,
    /// Text was printed (raw, just-answer or snippet); nothing to run.
    Printed,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::OneLiner | Outcome::Printed => 0,
            Outcome::ScriptSaved => 2,
        }
    }
}

/// A script persisted to disk. Never modified or deleted afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedScript {
    pub path: PathBuf,
    pub created_at: DateTime<Local>,
    pub language: Mode,
    pub contents: String,
}

impl SavedScript {
    /// The command line that runs this script.
    pub fn invocation(&self) -> String {
        invocation_for(self.language, &self.path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteResult {
    pub outcome: Outcome,
    /// Text placed at the hand-off location, if any.
    pub handoff: Option<String>,
    pub saved: Option<SavedScript>,
}

pub struct OutputRouter {
    output_dir: PathBuf,
    prompt_file: Option<PathBuf>,
    target: Option<FileContext>,
    time_provider: Box<dyn TimeProvider>,
    clipboard: fn(&str) -> bool,
}

impl OutputRouter {
    pub fn new(config: &Config, prompt_file: Option<PathBuf>) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            prompt_file,
            target: None,
            time_provider: Box::new(SystemTimeProvider),
            clipboard: clipboard::copy_to_clipboard,
        }
    }

    /// Writes replies back into an existing file instead of a dated one.
    pub fn with_target(mut self, target: Option<FileContext>) -> Self {
        self.target = target;
        self
    }

    pub fn with_time_provider(mut self, time_provider: Box<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn with_clipboard(mut self, clipboard: fn(&str) -> bool) -> Self {
        self.clipboard = clipboard;
        self
    }

    /// Sends a classified reply to its destination.
    ///
    /// # Arguments
    ///
    /// * `result` - The classified model reply
    /// * `stdout` - Machine-readable output (commands, invocations, verbatim text)
    /// * `stderr` - Human-facing output (saved script echo, snippet frame)
    ///
    /// # Returns
    ///
    /// What was done, the text handed off (if any) and the saved file (if any).
    /// [`Outcome::exit_code`] turns the outcome into the process exit status.
    ///
    /// # Errors
    ///
    /// Returns [`ShellmandoError::Output`] if a file cannot be written or a
    /// stream cannot be written to.
    pub fn route<W1: Write, W2: Write>(
        &self,
        result: ClassifiedResult,
        stdout: &mut W1,
        stderr: &mut W2,
    ) -> Result<RouteResult, ShellmandoError> {
        match result {
            ClassifiedResult::Verbatim { text } => {
                writeln!(stdout, "{}", text).map_err(|e| ShellmandoError::output("writing reply", e))?;
                Ok(RouteResult {
                    outcome: Outcome::Printed,
                    handoff: None,
                    saved: None,
                })
            }
            ClassifiedResult::Snippet { body, .. } => {
                self.show_snippet(&body, stderr)
                    .map_err(|e| ShellmandoError::output("showing snippet", e))?;
                Ok(RouteResult {
                    outcome: Outcome::Printed,
                    handoff: None,
                    saved: None,
                })
            }
            ClassifiedResult::OneLiner { command } => match &self.target {
                Some(target) => self.write_target(target, &command, stdout, stderr),
                None => {
                    self.hand_off(&command)?;
                    writeln!(stdout, "{}", command)
                        .map_err(|e| ShellmandoError::output("writing command", e))?;
                    Ok(RouteResult {
                        outcome: Outcome::OneLiner,
                        handoff: Some(command),
                        saved: None,
                    })
                }
            },
            ClassifiedResult::Script { language, body } => match &self.target {
                Some(target) => self.write_target(target, &body, stdout, stderr),
                None => {
                    let saved = self.save_script(&body, language)?;
                    self.finish_script(saved, stdout, stderr)
                }
            },
        }
    }

    /// Writes `text` to the hand-off file, if one was requested.
    fn hand_off(&self, text: &str) -> Result<(), ShellmandoError> {
        if let Some(path) = &self.prompt_file {
            replace_file(path, text, false).map_err(|e| {
                ShellmandoError::output(format!("writing hand-off file {}", path.display()), e)
            })?;
            debug!("Wrote hand-off file {}", path.display());
        }
        Ok(())
    }

    fn finish_script<W1: Write, W2: Write>(
        &self,
        saved: SavedScript,
        stdout: &mut W1,
        stderr: &mut W2,
    ) -> Result<RouteResult, ShellmandoError> {
        show_saved(&saved, stderr).map_err(|e| ShellmandoError::output("showing saved script", e))?;

        let invocation = saved.invocation();
        if self.prompt_file.is_some() {
            self.hand_off(&invocation)?;
        } else {
            writeln!(stdout, "{}", invocation)
                .map_err(|e| ShellmandoError::output("writing invocation", e))?;
        }
        Ok(RouteResult {
            outcome: Outcome::ScriptSaved,
            handoff: Some(invocation),
            saved: Some(saved),
        })
    }

    /// Saves `body` as a new file in today's directory.
    ///
    /// The file is named after the last non-`main` Python definition, or
    /// `script_HHMMSS`, with `_1`, `_2`... appended until the name is free.
    /// Existing files are never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`ShellmandoError::Output`] if the directory cannot be created or
    /// the file cannot be written.
    pub fn save_script(&self, body: &str, language: Mode) -> Result<SavedScript, ShellmandoError> {
        let now = self.time_provider.now();
        let folder = self.output_dir.join(now.format("%Y%m%d").to_string());
        fs::create_dir_all(&folder).map_err(|e| {
            ShellmandoError::output(format!("creating {}", folder.display()), e)
        })?;

        let label = script_label(body, language, &now);
        let extension = language.extension();
        let executable = language.is_shell();

        for index in 0u32.. {
            let name = if index == 0 {
                format!("{}.{}", label, extension)
            } else {
                format!("{}_{}.{}", label, index, extension)
            };
            let candidate = folder.join(name);
            if candidate.exists() {
                continue;
            }
            match write_new_file(&folder, &candidate, body, executable) {
                Ok(()) => {
                    info!("Saved {} script to {}", language, candidate.display());
                    return Ok(SavedScript {
                        path: candidate,
                        created_at: now,
                        language,
                        contents: body.to_string(),
                    });
                }
                // Lost a race for this name; try the next one.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(ShellmandoError::output(
                        format!("writing {}", candidate.display()),
                        e,
                    ));
                }
            }
        }
        unreachable!("u32 file name indices exhausted")
    }

    fn write_target<W1: Write, W2: Write>(
        &self,
        target: &FileContext,
        reply: &str,
        stdout: &mut W1,
        stderr: &mut W2,
    ) -> Result<RouteResult, ShellmandoError> {
        let contents = match target.action {
            FileAction::Edit => reply.to_string(),
            FileAction::Append => {
                let mut contents = target.contents.clone();
                if !contents.is_empty() && !contents.ends_with('\n') {
                    contents.push('\n');
                }
                contents.push_str(reply);
                contents
            }
        };
        let path = absolute_path(&target.path);
        let language = language_for_path(&path);

        replace_file(&path, &contents, language.is_shell()).map_err(|e| {
            ShellmandoError::output(format!("writing {}", path.display()), e)
        })?;
        info!("Updated {}", path.display());

        let saved = SavedScript {
            path,
            created_at: self.time_provider.now(),
            language,
            contents,
        };
        self.finish_script(saved, stdout, stderr)
    }

    fn show_snippet<W: Write>(&self, body: &str, stderr: &mut W) -> io::Result<()> {
        let rule = "_".repeat(RULE_WIDTH);
        writeln!(stderr, "{}", rule)?;
        writeln!(stderr, "{}", body)?;
        writeln!(stderr, "{}", rule)?;
        if (self.clipboard)(body) {
            writeln!(stderr, "  >> copied to clipboard")?;
        } else {
            writeln!(stderr, "  >> clipboard not available, use the output above")?;
            if std::env::consts::OS == "linux" {
                writeln!(stderr, "  >> install xclip, xsel or wl-clipboard to enable copying")?;
            }
        }
        Ok(())
    }
}

fn show_saved<W: Write>(saved: &SavedScript, stderr: &mut W) -> io::Result<()> {
    let rule = "_".repeat(RULE_WIDTH);
    writeln!(stderr, "{}", rule)?;
    writeln!(stderr, "{}", saved.contents)?;
    writeln!(stderr, "{}", rule)?;
    writeln!(stderr, "saved to {}", saved.path.display())
}

/// The file's language, judged by extension. Unknown extensions are treated
/// as plain text.
fn language_for_path(path: &Path) -> Mode {
    match path.extension().and_then(|e| e.to_str()) {
        Some("py") => Mode::Python,
        Some("sh") | Some("bash") => Mode::Bash,
        Some("zsh") => Mode::Zsh,
        Some("fish") => Mode::Fish,
        _ => Mode::None,
    }
}

/// `path` made absolute against the working directory, so the shell never
/// looks a bare file name up on `PATH`.
fn absolute_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn invocation_for(language: Mode, path: &Path) -> String {
    let quoted = shell_quote(&absolute_path(path).to_string_lossy());
    match language {
        Mode::Python => format!("python3 {}", quoted),
        Mode::None => format!("cat {}", quoted),
        _ => quoted,
    }
}

fn shell_quote(text: &str) -> String {
    let safe = text
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-+:@%=,".contains(c));
    if safe && !text.is_empty() {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

/// Names a script after its last non-`main` Python function or class, or
/// `script_HHMMSS` otherwise.
fn script_label(body: &str, language: Mode, now: &DateTime<Local>) -> String {
    if language == Mode::Python {
        if let Some(name) = last_python_definition(body) {
            return name;
        }
    }
    format!("script_{}", now.format("%H%M%S"))
}

fn last_python_definition(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let rest = line
                .strip_prefix("async def ")
                .or_else(|| line.strip_prefix("def "))
                .or_else(|| line.strip_prefix("class "))?;
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            (!name.is_empty() && name != "main").then_some(name)
        })
        .last()
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Existing permissions, plus execute wherever read is granted when the
/// file must be runnable by path.
#[cfg(unix)]
fn carried_permissions(meta: &fs::Metadata, executable: bool) -> fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    let mode = meta.permissions().mode();
    if executable {
        fs::Permissions::from_mode(mode | ((mode & 0o444) >> 2))
    } else {
        meta.permissions()
    }
}

#[cfg(not(unix))]
fn carried_permissions(meta: &fs::Metadata, _executable: bool) -> fs::Permissions {
    meta.permissions()
}

/// Creates `path` with `contents`, failing with `AlreadyExists` rather than
/// overwriting.
fn write_new_file(dir: &Path, path: &Path, contents: &str, executable: bool) -> io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    set_mode(tmp.as_file(), if executable { 0o755 } else { 0o644 })?;
    tmp.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

/// Atomically replaces (or creates) `path`, keeping existing permissions.
/// Shell scripts additionally gain execute permission.
fn replace_file(path: &Path, contents: &str, executable: bool) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    match fs::metadata(path) {
        Ok(meta) => tmp.as_file().set_permissions(carried_permissions(&meta, executable))?,
        Err(_) => set_mode(tmp.as_file(), if executable { 0o755 } else { 0o644 })?,
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
