//! Layered configuration.
//!
//! Every invocation resolves exactly one [`Config`] by applying override
//! layers on top of built-in defaults, lowest priority first:
//!
//! 1. built-in defaults
//! 2. TOML config file
//! 3. `SHELLMANDO_*` environment variables
//! 4. command-line flags
//!
//! Validation runs once, on the merged result. The resolver never writes the
//! config file back.

use dirs::home_dir;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_HOST: &str = "http://localhost:8280";
pub const DEFAULT_MODEL: &str = "default";
pub const DEFAULT_TEMPERATURE: f64 = 0.1;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 120;
pub const DEFAULT_MAX_RETRIES: u32 = 30;
pub const DEFAULT_RETRY_DELAY_SECONDS: f64 = 1.0;
pub const DEFAULT_STARTUP_TIMEOUT_SECONDS: u64 = 50;
pub const DEFAULT_OUTPUT_DIR: &str = "~/scripts/shellmando_out";

pub const DEFAULT_SHELL_SYSTEM_PROMPT: &str = "You are a {mode} expert on {os}. \
Reply ONLY with the needed command(s), no explanation. Use variables only if necessary.";
pub const DEFAULT_PYTHON_SYSTEM_PROMPT: &str = "You are a Python {python_version} expert on {os}. \
Reply ONLY with Python code. No explanation, no prose.";
pub const DEFAULT_PYTHON_USER_PREFIX: &str = "In Python {python_version}: ";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "SHELLMANDO_CONFIG";

const ENV_HOST: &str = "SHELLMANDO_HOST";
const ENV_STARTER: &str = "SHELLMANDO_LLM_STARTER";
const ENV_MODEL: &str = "SHELLMANDO_MODEL";
const ENV_MODE: &str = "SHELLMANDO_MODE";
const ENV_TEMPERATURE: &str = "SHELLMANDO_TEMPERATURE";
const ENV_OS: &str = "SHELLMANDO_OS";
const ENV_TIMEOUT: &str = "SHELLMANDO_TIMEOUT";
const ENV_RETRIES: &str = "SHELLMANDO_RETRIES";
const ENV_RETRY_DELAY: &str = "SHELLMANDO_RETRY_DELAY";
const ENV_STARTUP_TIMEOUT: &str = "SHELLMANDO_STARTUP_TIMEOUT";
const ENV_OUTPUT: &str = "SHELLMANDO_OUTPUT";

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The chosen config file exists but is not valid for the expected schema.
    #[error("malformed config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A resolved value violates its declared type or range.
    #[error("invalid value for {field}: {message}")]
    Value { field: &'static str, message: String },
}

impl ConfigError {
    fn value(field: &'static str, message: impl Into<String>) -> Self {
        Self::Value {
            field,
            message: message.into(),
        }
    }
}

/// Target language of the generated command or script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Bash,
    Sh,
    Zsh,
    Fish,
    Python,
    None,
}

impl Mode {
    pub const ALL: [Mode; 6] = [
        Mode::Bash,
        Mode::Sh,
        Mode::Zsh,
        Mode::Fish,
        Mode::Python,
        Mode::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Bash => "bash",
            Mode::Sh => "sh",
            Mode::Zsh => "zsh",
            Mode::Fish => "fish",
            Mode::Python => "python",
            Mode::None => "none",
        }
    }

    pub fn is_shell(&self) -> bool {
        matches!(self, Mode::Bash | Mode::Sh | Mode::Zsh | Mode::Fish)
    }

    /// File extension used when a reply in this language is saved.
    pub fn extension(&self) -> &'static str {
        match self {
            Mode::Bash | Mode::Sh => "sh",
            Mode::Zsh => "zsh",
            Mode::Fish => "fish",
            Mode::Python => "py",
            Mode::None => "txt",
        }
    }

    /// Maps a code-fence language annotation to a mode.
    pub fn from_fence_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "bash" | "shell" | "console" => Some(Mode::Bash),
            "sh" => Some(Mode::Sh),
            "zsh" => Some(Mode::Zsh),
            "fish" => Some(Mode::Fish),
            "python" | "python3" | "py" => Some(Mode::Python),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == value)
            .ok_or_else(|| {
                let allowed: Vec<&str> = Mode::ALL.iter().map(Mode::as_str).collect();
                ConfigError::value(
                    "mode",
                    format!("'{}' is not one of {}", value, allowed.join(", ")),
                )
            })
    }
}

/// One template family: the system prompt plus optional user prompt wrapping.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptFamily {
    pub system: String,
    pub user_prefix: String,
    pub user_suffix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplates {
    pub shell: PromptFamily,
    pub python: PromptFamily,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            shell: PromptFamily {
                system: DEFAULT_SHELL_SYSTEM_PROMPT.to_string(),
                user_prefix: String::new(),
                user_suffix: String::new(),
            },
            python: PromptFamily {
                system: DEFAULT_PYTHON_SYSTEM_PROMPT.to_string(),
                user_prefix: DEFAULT_PYTHON_USER_PREFIX.to_string(),
                user_suffix: String::new(),
            },
        }
    }
}

/// The resolved, validated configuration for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub starter_path: Option<PathBuf>,
    pub model: String,
    pub mode: Mode,
    pub temperature: f64,
    pub os_string: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: f64,
    pub startup_timeout_seconds: u64,
    pub output_dir: PathBuf,
    pub prompt_templates: PromptTemplates,
    pub system_prompt_override: Option<String>,
    /// The config file that contributed to this configuration, if any.
    pub source_file: Option<PathBuf>,
}

/// Partial overrides for a template family.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptOverrides {
    pub system: Option<String>,
    pub user_prefix: Option<String>,
    pub user_suffix: Option<String>,
}

/// One configuration layer. Every field is optional; `None` means "no opinion".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    /// Explicit config file location. Only consulted on the CLI layer.
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub starter_path: Option<String>,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub temperature: Option<f64>,
    pub os_string: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<f64>,
    pub startup_timeout_seconds: Option<u64>,
    pub output_dir: Option<String>,
    pub shell_prompts: PromptOverrides,
    pub python_prompts: PromptOverrides,
    pub system_prompt_override: Option<String>,
}

impl Overrides {
    /// Builds the environment layer. Non-numeric values for numeric fields are
    /// value errors, not silently ignored.
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| env.get(key).filter(|v| !v.is_empty()).cloned();

        Ok(Self {
            host: get(ENV_HOST),
            starter_path: get(ENV_STARTER),
            model: get(ENV_MODEL),
            mode: get(ENV_MODE),
            temperature: parse_env(env, ENV_TEMPERATURE, "temperature")?,
            os_string: get(ENV_OS),
            timeout_seconds: parse_env(env, ENV_TIMEOUT, "timeout_seconds")?,
            max_retries: parse_env(env, ENV_RETRIES, "max_retries")?,
            retry_delay_seconds: parse_env(env, ENV_RETRY_DELAY, "retry_delay_seconds")?,
            startup_timeout_seconds: parse_env(
                env,
                ENV_STARTUP_TIMEOUT,
                "startup_timeout_seconds",
            )?,
            output_dir: get(ENV_OUTPUT),
            ..Self::default()
        })
    }

    fn from_file(file: FileConfig) -> Self {
        Self {
            host: file.llm.host,
            starter_path: file.llm.starter,
            model: file.llm.model,
            mode: file.generation.mode,
            temperature: file.generation.temperature.map(Number::as_f64),
            os_string: file.generation.os,
            timeout_seconds: file.network.timeout,
            max_retries: file.network.retries,
            retry_delay_seconds: file.network.retry_delay.map(Number::as_f64),
            startup_timeout_seconds: file.network.startup_timeout,
            output_dir: file.output.dir,
            shell_prompts: file.prompts.shell.into(),
            python_prompts: file.prompts.python.into(),
            ..Self::default()
        }
    }
}

fn parse_env<T: FromStr>(
    env: &HashMap<String, String>,
    key: &str,
    field: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            ConfigError::value(field, format!("{}='{}' is not a valid number", key, raw))
        }),
        None => Ok(None),
    }
}

// =============================================================================
// Config file schema
// =============================================================================

/// TOML accepts `1` and `1.0` alike for float settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    llm: LlmSection,
    #[serde(default)]
    generation: GenerationSection,
    #[serde(default)]
    network: NetworkSection,
    #[serde(default)]
    output: OutputSection,
    #[serde(default)]
    prompts: PromptsSection,
}

#[derive(Debug, Default, Deserialize)]
struct LlmSection {
    host: Option<String>,
    starter: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerationSection {
    temperature: Option<Number>,
    mode: Option<String>,
    os: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkSection {
    timeout: Option<u64>,
    retries: Option<u32>,
    retry_delay: Option<Number>,
    startup_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OutputSection {
    dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptsSection {
    #[serde(default)]
    shell: PromptSection,
    #[serde(default)]
    python: PromptSection,
}

#[derive(Debug, Default, Deserialize)]
struct PromptSection {
    system: Option<String>,
    user_prefix: Option<String>,
    user_suffix: Option<String>,
}

impl From<PromptSection> for PromptOverrides {
    fn from(section: PromptSection) -> Self {
        Self {
            system: section.system,
            user_prefix: section.user_prefix,
            user_suffix: section.user_suffix,
        }
    }
}

// =============================================================================
// Merge
// =============================================================================

/// Merged but not yet validated settings.
#[derive(Debug, Clone)]
struct Settings {
    host: String,
    starter_path: Option<String>,
    model: String,
    mode: String,
    temperature: f64,
    os_string: String,
    timeout_seconds: u64,
    max_retries: u32,
    retry_delay_seconds: f64,
    startup_timeout_seconds: u64,
    output_dir: String,
    prompt_templates: PromptTemplates,
    system_prompt_override: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            starter_path: None,
            model: DEFAULT_MODEL.to_string(),
            mode: Mode::Bash.as_str().to_string(),
            temperature: DEFAULT_TEMPERATURE,
            os_string: String::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_seconds: DEFAULT_RETRY_DELAY_SECONDS,
            startup_timeout_seconds: DEFAULT_STARTUP_TIMEOUT_SECONDS,
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            prompt_templates: PromptTemplates::default(),
            system_prompt_override: None,
        }
    }
}

fn override_field<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *slot = value.clone();
    }
}

fn override_family(family: &mut PromptFamily, layer: &PromptOverrides) {
    override_field(&mut family.system, &layer.system);
    override_field(&mut family.user_prefix, &layer.user_prefix);
    override_field(&mut family.user_suffix, &layer.user_suffix);
}

impl Settings {
    fn apply(mut self, layer: &Overrides) -> Self {
        override_field(&mut self.host, &layer.host);
        if layer.starter_path.is_some() {
            self.starter_path = layer.starter_path.clone();
        }
        override_field(&mut self.model, &layer.model);
        override_field(&mut self.mode, &layer.mode);
        override_field(&mut self.temperature, &layer.temperature);
        override_field(&mut self.os_string, &layer.os_string);
        override_field(&mut self.timeout_seconds, &layer.timeout_seconds);
        override_field(&mut self.max_retries, &layer.max_retries);
        override_field(&mut self.retry_delay_seconds, &layer.retry_delay_seconds);
        override_field(
            &mut self.startup_timeout_seconds,
            &layer.startup_timeout_seconds,
        );
        override_field(&mut self.output_dir, &layer.output_dir);
        override_family(&mut self.prompt_templates.shell, &layer.shell_prompts);
        override_family(&mut self.prompt_templates.python, &layer.python_prompts);
        if layer.system_prompt_override.is_some() {
            self.system_prompt_override = layer.system_prompt_override.clone();
        }
        self
    }

    fn validate(
        self,
        os_detector: fn() -> String,
        source_file: Option<PathBuf>,
    ) -> Result<Config, ConfigError> {
        let host = self.host.trim().trim_end_matches('/').to_string();
        if host.is_empty() {
            return Err(ConfigError::value("host", "must not be empty"));
        }
        if !(host.starts_with("http://") || host.starts_with("https://")) {
            return Err(ConfigError::value(
                "host",
                format!("'{}' must start with http:// or https://", host),
            ));
        }

        let model = self.model.trim().to_string();
        if model.is_empty() {
            return Err(ConfigError::value("model", "must not be empty"));
        }

        let mode: Mode = self.mode.parse()?;

        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::value(
                "temperature",
                format!("{} is outside [0, 2]", self.temperature),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::value("timeout_seconds", "must be positive"));
        }
        if self.startup_timeout_seconds == 0 {
            return Err(ConfigError::value(
                "startup_timeout_seconds",
                "must be positive",
            ));
        }
        if !self.retry_delay_seconds.is_finite() || self.retry_delay_seconds < 0.0 {
            return Err(ConfigError::value(
                "retry_delay_seconds",
                format!("{} must be a non-negative number", self.retry_delay_seconds),
            ));
        }

        let os_string = match self.os_string.trim() {
            "" => os_detector(),
            given => given.to_string(),
        };

        let starter_path = self
            .starter_path
            .filter(|s| !s.trim().is_empty())
            .map(|s| expand_tilde(s.trim()));

        Ok(Config {
            host,
            starter_path,
            model,
            mode,
            temperature: self.temperature,
            os_string,
            timeout_seconds: self.timeout_seconds,
            max_retries: self.max_retries,
            retry_delay_seconds: self.retry_delay_seconds,
            startup_timeout_seconds: self.startup_timeout_seconds,
            output_dir: expand_tilde(self.output_dir.trim()),
            prompt_templates: self.prompt_templates,
            system_prompt_override: self.system_prompt_override,
            source_file,
        })
    }
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves a [`Config`] from the CLI layer, an environment snapshot and the
/// config file search path.
pub struct ConfigResolver {
    env: HashMap<String, String>,
    search_paths: Vec<PathBuf>,
    os_detector: fn() -> String,
}

impl ConfigResolver {
    /// Creates a resolver over an explicit environment and search path list.
    pub fn new(env: HashMap<String, String>, search_paths: Vec<PathBuf>) -> Self {
        Self {
            env,
            search_paths,
            os_detector: crate::prompt::detect_os,
        }
    }

    /// Creates a resolver for the running process: its environment, the user
    /// config location and the file next to the executable.
    pub fn from_process() -> Self {
        Self::new(std::env::vars().collect(), Self::default_search_paths())
    }

    /// Replaces OS auto-detection, used when no OS string is configured.
    pub fn with_os_detector(mut self, detector: fn() -> String) -> Self {
        self.os_detector = detector;
        self
    }

    pub fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = home_dir() {
            paths.push(home.join(".config").join("shellmando").join("config.toml"));
        }
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            paths.push(dir.join("shellmando.toml"));
        }
        paths
    }

    /// Merges defaults, config file, environment and CLI overrides.
    ///
    /// Later layers win: CLI over environment over file over defaults.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::Parse`] if the chosen config file is not valid TOML or
    ///   has wrongly typed keys
    /// * [`ConfigError::Value`] if a merged value is out of range or unparsable
    pub fn resolve(&self, cli: &Overrides) -> Result<Config, ConfigError> {
        let (source_file, file_layer) = match self.load_file(cli)? {
            Some((path, layer)) => (Some(path), layer),
            None => {
                info!("No config file found, using defaults");
                (None, Overrides::default())
            }
        };
        let env_layer = Overrides::from_env(&self.env)?;

        let settings = [&file_layer, &env_layer, cli]
            .into_iter()
            .fold(Settings::default(), Settings::apply);

        let config = settings.validate(self.os_detector, source_file)?;
        debug!("Resolved configuration: {:?}", config);
        Ok(config)
    }

    fn candidates(&self, cli: &Overrides) -> Vec<PathBuf> {
        let explicit = cli.config_path.clone();
        let from_env = self
            .env
            .get(CONFIG_ENV_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(|v| expand_tilde(v.trim()));

        explicit
            .into_iter()
            .chain(from_env)
            .chain(self.search_paths.iter().cloned())
            .collect()
    }

    /// Loads the first existing, readable config file.
    fn load_file(&self, cli: &Overrides) -> Result<Option<(PathBuf, Overrides)>, ConfigError> {
        for path in self.candidates(cli) {
            if !path.is_file() {
                debug!("Config candidate {} does not exist", path.display());
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping unreadable config file {}: {}", path.display(), e);
                    continue;
                }
            };
            let file: FileConfig = toml::from_str(&content).map_err(|source| {
                ConfigError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;
            info!("Loaded config from: {}", path.display());
            return Ok(Some((path, Overrides::from_file(file))));
        }
        Ok(None)
    }
}
