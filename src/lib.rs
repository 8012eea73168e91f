//! Shellmando - turns a task description into a shell command or script using
//! a local LLM.
//!
//! A single invocation resolves configuration, makes sure the local
//! OpenAI-compatible backend is up (starting it if necessary), asks the model,
//! and decides what kind of answer came back:
//!
//! - **One-liners** are handed to the shell wrapper to prefill the prompt
//! - **Scripts** are saved under a dated directory and their invocation is
//!   handed off instead
//! - **Raw, just-answer and snippet** replies are printed for the user
//!
//! Nothing generated is ever executed.
//!
//! # Architecture
//!
//! - [`config`] - Layered configuration (defaults, file, environment, CLI)
//! - [`backend`] - Health probing and starting the backend
//! - [`prompt`] - Prompt templates and context
//! - [`request`] - Chat-completion requests with bounded retries
//! - [`classifier`] - One-liner/script classification
//! - [`output`] - Hand-off file, saved scripts, printed output
//! - [`orchestrator`] - Runs the whole pipeline
//! - [`providers`] - Shared dependency injection traits
//! - [`http_client`] - HTTP client abstraction
//!
//! # Example
//!
//! ```ignore
//! use shellmando::config::{ConfigResolver, Overrides};
//! use shellmando::orchestrator::{Invocation, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigResolver::from_process().resolve(&Overrides::default())?;
//!     let invocation = Invocation {
//!         task: "find files larger than 100MB".to_string(),
//!         ..Invocation::default()
//!     };
//!
//!     let routed = Orchestrator::new(config)
//!         .run(&invocation, &mut std::io::stdout(), &mut std::io::stderr())
//!         .await?;
//!     std::process::exit(routed.outcome.exit_code());
//! }
//! ```

pub mod backend;
pub mod classifier;
pub mod clipboard;
pub mod config;
pub mod error;
pub mod http_client;
pub mod orchestrator;
pub mod output;
pub mod prompt;
pub mod providers;
pub mod request;
