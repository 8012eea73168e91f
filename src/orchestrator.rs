//! Runs one request end to end: prompt, backend, model, classification, output.

use crate::backend::BackendSupervisor;
use crate::classifier::{ClassifiedResult, ClassifyOptions, ResponseClassifier};
use crate::config::{Config, Mode};
use crate::error::ShellmandoError;
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::output::{OutputRouter, RouteResult};
use crate::prompt::{self, FileAction, FileContext, PromptBuilder, PromptContext, PromptStyle};
use crate::providers::{ProcessLauncher, SystemProcessLauncher, TimeProvider};
use crate::request::{RequestClient, RequestError};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the user asked for in this invocation, apart from configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    pub task: String,
    pub options: ClassifyOptions,
    /// File to append to or edit in place.
    pub target: Option<(PathBuf, FileAction)>,
    /// Hand-off file read back by the shell wrapper.
    pub prompt_file: Option<PathBuf>,
}

impl Invocation {
    fn style(&self) -> PromptStyle {
        if self.options.just_answer {
            PromptStyle::JustAnswer
        } else if self.options.snippet {
            PromptStyle::Snippet
        } else {
            PromptStyle::Standard
        }
    }
}

pub struct Orchestrator {
    config: Config,
    http: Arc<dyn HttpClient>,
    launcher: Arc<dyn ProcessLauncher>,
    time_provider: Option<Box<dyn TimeProvider>>,
    python_version: fn() -> String,
    clipboard: Option<fn(&str) -> bool>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self::with_dependencies(
            config,
            Arc::new(ReqwestHttpClient::new()),
            Arc::new(SystemProcessLauncher),
        )
    }

    pub fn with_dependencies(
        config: Config,
        http: Arc<dyn HttpClient>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            config,
            http,
            launcher,
            time_provider: None,
            python_version: prompt::detect_python_version,
            clipboard: None,
        }
    }

    pub fn with_time_provider(mut self, time_provider: Box<dyn TimeProvider>) -> Self {
        self.time_provider = Some(time_provider);
        self
    }

    pub fn with_python_version(mut self, detector: fn() -> String) -> Self {
        self.python_version = detector;
        self
    }

    pub fn with_clipboard(mut self, clipboard: fn(&str) -> bool) -> Self {
        self.clipboard = Some(clipboard);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the pipeline; Ctrl-C during backend startup aborts it.
    ///
    /// # Arguments
    ///
    /// * `invocation` - Task, output switches and target files
    /// * `stdout` - Receives machine-readable output only
    /// * `stderr` - Receives human-facing output
    ///
    /// # Errors
    ///
    /// Any [`ShellmandoError`]; its [`ShellmandoError::stage`] says which step
    /// failed.
    pub async fn run<W1: Write, W2: Write>(
        self,
        invocation: &Invocation,
        stdout: &mut W1,
        stderr: &mut W2,
    ) -> Result<RouteResult, ShellmandoError> {
        let supervisor = BackendSupervisor::new(&self.config, self.http.clone(), self.launcher.clone());
        let context = self.prompt_context(invocation)?;
        supervisor.ensure_ready().await?;
        self.finish(invocation, context, stdout, stderr).await
    }

    /// Like [`Orchestrator::run`], with an explicit cancellation signal.
    pub async fn run_until<C, W1, W2>(
        self,
        invocation: &Invocation,
        cancel: C,
        stdout: &mut W1,
        stderr: &mut W2,
    ) -> Result<RouteResult, ShellmandoError>
    where
        C: Future<Output = ()>,
        W1: Write,
        W2: Write,
    {
        let supervisor = BackendSupervisor::new(&self.config, self.http.clone(), self.launcher.clone());
        let context = self.prompt_context(invocation)?;
        supervisor.ensure_ready_until(cancel).await?;
        self.finish(invocation, context, stdout, stderr).await
    }

    fn prompt_context(&self, invocation: &Invocation) -> Result<PromptContext, ShellmandoError> {
        // Only python prompts mention the interpreter version.
        let python_version = if self.config.mode == Mode::Python {
            (self.python_version)()
        } else {
            "3".to_string()
        };
        let context = PromptContext::new(self.config.mode, self.config.os_string.clone(), python_version);

        match &invocation.target {
            Some((path, action)) => {
                let file = FileContext::load(path, *action).map_err(|e| {
                    ShellmandoError::output(format!("reading {}", path.display()), e)
                })?;
                debug!("Loaded {} bytes from {}", file.contents.len(), path.display());
                Ok(context.with_file(file))
            }
            None => Ok(context),
        }
    }

    async fn finish<W1: Write, W2: Write>(
        self,
        invocation: &Invocation,
        context: PromptContext,
        stdout: &mut W1,
        stderr: &mut W2,
    ) -> Result<RouteResult, ShellmandoError> {
        let prompt = PromptBuilder::new(&self.config).build(&invocation.task, &context, invocation.style());
        debug!("[llm] system prompt:\n{}", prompt.system);
        debug!("[llm] user prompt:\n{}", prompt.user);

        let reply = RequestClient::new(&self.config, self.http.clone()).send(&prompt).await?;
        info!(
            "Reply received in {:.1}s ({} retries)",
            reply.elapsed.as_secs_f64(),
            reply.retries_used
        );

        let classified =
            ResponseClassifier::default().classify(&reply.content, self.config.mode, invocation.options);
        if let ClassifiedResult::OneLiner { command } = &classified {
            if command.is_empty() {
                return Err(RequestError::Malformed("reply contained no code".to_string()).into());
            }
        }

        let mut router = OutputRouter::new(&self.config, invocation.prompt_file.clone())
            .with_target(context.file);
        if let Some(time_provider) = self.time_provider {
            router = router.with_time_provider(time_provider);
        }
        if let Some(clipboard) = self.clipboard {
            router = router.with_clipboard(clipboard);
        }
        router.route(classified, stdout, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, Overrides};
    use crate::http_client::testing::ScriptedHttpClient;
    use crate::http_client::{HttpResponse, TransportError};
    use crate::output::Outcome;
    use crate::providers::testing::{FixedTimeProvider, RecordingLauncher};
    use std::fs;
    use tempfile::TempDir;

    const HOST: &str = "http://127.0.0.1:8280";

    fn config(dir: &TempDir, mode: &str) -> Config {
        let cli = Overrides {
            host: Some(HOST.to_string()),
            mode: Some(mode.to_string()),
            output_dir: Some(dir.path().join("out").to_string_lossy().to_string()),
            os_string: Some("Linux / Test / x86_64".to_string()),
            max_retries: Some(2),
            retry_delay_seconds: Some(0.0),
            ..Overrides::default()
        };
        ConfigResolver::new(Default::default(), vec![]).resolve(&cli).unwrap()
    }

    fn completion(content: &str) -> HttpResponse {
        HttpResponse::new(
            200,
            serde_json::json!({"choices": [{"message": {"content": content}}]}).to_string(),
        )
    }

    fn healthy_backend(reply: &str) -> Arc<ScriptedHttpClient> {
        Arc::new(
            ScriptedHttpClient::new()
                .on_get(&format!("{}/health", HOST), vec![Ok(HttpResponse::new(200, "ok"))])
                .on_post(vec![Ok(completion(reply))]),
        )
    }

    fn python_311() -> String {
        "3.11".to_string()
    }

    fn no_clipboard(_: &str) -> bool {
        false
    }

    fn orchestrator(config: Config, http: Arc<ScriptedHttpClient>) -> Orchestrator {
        Orchestrator::with_dependencies(config, http, Arc::new(RecordingLauncher::default()))
            .with_time_provider(Box::new(FixedTimeProvider::at(2026, 10, 17, 8, 0, 0)))
            .with_python_version(python_311)
            .with_clipboard(no_clipboard)
    }

    fn invocation(task: &str, prompt_file: Option<PathBuf>) -> Invocation {
        Invocation {
            task: task.to_string(),
            prompt_file,
            ..Invocation::default()
        }
    }

    #[tokio::test]
    async fn test_one_liner_round_trip() {
        let dir = TempDir::new().unwrap();
        let prompt_file = dir.path().join("prompt");
        let http = healthy_backend("```bash\nfind . -size +100M\n```");
        let orchestrator = orchestrator(config(&dir, "bash"), http.clone());

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let routed = orchestrator
            .run(&invocation("find files over 100MB", Some(prompt_file.clone())), &mut stdout, &mut stderr)
            .await
            .unwrap();

        assert_eq!(routed.outcome, Outcome::OneLiner);
        assert_eq!(fs::read_to_string(&prompt_file).unwrap(), "find . -size +100M");
        let body = &http.post_bodies.lock().unwrap()[0];
        assert!(body["messages"][0]["content"].as_str().unwrap().contains("bash expert"));
        assert_eq!(body["messages"][1]["content"], "find files over 100MB");
    }

    #[tokio::test]
    async fn test_python_script_saved_with_version_prefix() {
        let dir = TempDir::new().unwrap();
        let http = healthy_backend("```python\nimport os\nprint(os.getcwd())\n```");
        let orchestrator = orchestrator(config(&dir, "python"), http.clone());

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let routed = orchestrator
            .run(&invocation("print cwd", None), &mut stdout, &mut stderr)
            .await
            .unwrap();

        assert_eq!(routed.outcome.exit_code(), 2);
        let saved = routed.saved.unwrap();
        assert!(saved.path.starts_with(dir.path().join("out/20261017")));
        assert_eq!(
            String::from_utf8(stdout).unwrap().trim(),
            format!("python3 {}", saved.path.display())
        );
        let body = &http.post_bodies.lock().unwrap()[0];
        assert!(body["messages"][1]["content"].as_str().unwrap().starts_with("In Python 3.11: print cwd"));
    }

    #[tokio::test]
    async fn test_edit_sends_file_and_writes_back() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("greet.sh");
        fs::write(&target, "echo hello\n").unwrap();
        let http = healthy_backend("echo hello\necho world");
        let orchestrator = orchestrator(config(&dir, "bash"), http.clone());

        let request = Invocation {
            target: Some((target.clone(), FileAction::Edit)),
            ..invocation("also greet the world", None)
        };
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let routed = orchestrator.run(&request, &mut stdout, &mut stderr).await.unwrap();

        assert_eq!(routed.outcome, Outcome::ScriptSaved);
        assert_eq!(fs::read_to_string(&target).unwrap(), "echo hello\necho world");
        let body = &http.post_bodies.lock().unwrap()[0];
        assert!(body["messages"][1]["content"].as_str().unwrap().contains("echo hello\n"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_without_starter_is_backend_error() {
        let dir = TempDir::new().unwrap();
        let http = Arc::new(ScriptedHttpClient::new());
        let orchestrator = orchestrator(config(&dir, "bash"), http.clone());

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let err = orchestrator
            .run_until(&invocation("ls", None), std::future::pending(), &mut stdout, &mut stderr)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "backend");
        assert_eq!(http.post_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_failure_is_request_error() {
        let dir = TempDir::new().unwrap();
        let http = Arc::new(
            ScriptedHttpClient::new()
                .on_get(&format!("{}/health", HOST), vec![Ok(HttpResponse::new(200, "ok"))])
                .on_post(vec![Err(TransportError::Timeout)]),
        );
        let orchestrator = orchestrator(config(&dir, "bash"), http.clone());

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let err = orchestrator
            .run(&invocation("ls", None), &mut stdout, &mut stderr)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "request");
        assert_eq!(http.post_count(), 2);
        assert!(stdout.is_empty());
    }

    #[tokio::test]
    async fn test_empty_fenced_reply_is_request_error() {
        let dir = TempDir::new().unwrap();
        let prompt_file = dir.path().join("prompt");
        let orchestrator = orchestrator(config(&dir, "bash"), healthy_backend("```bash\n```"));

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let err = orchestrator
            .run(&invocation("ls", Some(prompt_file.clone())), &mut stdout, &mut stderr)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "request");
        assert!(!prompt_file.exists());
    }

    #[tokio::test]
    async fn test_raw_reply_printed_untouched() {
        let dir = TempDir::new().unwrap();
        let reply = "```bash\nls\n```";
        let orchestrator = orchestrator(config(&dir, "bash"), healthy_backend(reply));

        let request = Invocation {
            options: ClassifyOptions {
                raw: true,
                ..ClassifyOptions::default()
            },
            ..invocation("ls", None)
        };
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let routed = orchestrator.run(&request, &mut stdout, &mut stderr).await.unwrap();

        assert_eq!(routed.outcome, Outcome::Printed);
        assert_eq!(String::from_utf8(stdout).unwrap(), format!("{}\n", reply));
    }
}
