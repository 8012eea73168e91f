use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use shellmando::classifier::ClassifyOptions;
use shellmando::config::{ConfigResolver, Overrides};
use shellmando::error::ShellmandoError;
use shellmando::orchestrator::{Invocation, Orchestrator};
use shellmando::prompt::FileAction;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("shellmando")
        .about("Turns a task description into a shell command or script using a local LLM")
        .long_about(
            "shellmando asks a local OpenAI-compatible LLM for a command. One-liners are handed \
             to the shell prompt; longer scripts are saved under a dated directory and their \
             invocation is handed off instead. Nothing is executed.\n\n\
             Exit status: 0 one-liner ready or text printed, 1 failure, 2 script saved.",
        )
        .arg(Arg::new("task")
            .help("What you want to do, in plain words")
            .num_args(1..)
            .required(true))
        .arg(Arg::new("host")
            .long("host")
            .help("LLM endpoint base URL")
            .value_name("URL"))
        .arg(Arg::new("starter")
            .long("starter")
            .help("Executable that starts the LLM backend")
            .value_name("PATH"))
        .arg(Arg::new("model")
            .long("model")
            .help("Model name sent with the request"))
        .arg(Arg::new("mode")
            .short('m')
            .long("mode")
            .help("Target language: bash, sh, zsh, fish, python or none"))
        .arg(Arg::new("temperature")
            .short('t')
            .long("temperature")
            .value_parser(value_parser!(f64)))
        .arg(Arg::new("output")
            .short('o')
            .long("output")
            .help("Directory for saved scripts")
            .value_name("DIR"))
        .arg(Arg::new("config")
            .long("config")
            .help("Config file to use instead of the default locations")
            .value_name("FILE")
            .value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("system-prompt")
            .long("system-prompt")
            .help("Replace the system prompt")
            .value_name("TEXT"))
        .arg(Arg::new("os")
            .long("os")
            .help("OS description used in prompts (default: detected)"))
        .arg(Arg::new("timeout")
            .long("timeout")
            .help("Per-request timeout in seconds")
            .value_name("SECONDS")
            .value_parser(value_parser!(u64)))
        .arg(Arg::new("retries")
            .long("retries")
            .help("Total request attempts on timeouts and refused connections")
            .value_parser(value_parser!(u32)))
        .arg(Arg::new("retry-delay")
            .long("retry-delay")
            .help("Seconds between request attempts")
            .value_name("SECONDS")
            .value_parser(value_parser!(f64)))
        .arg(Arg::new("startup-timeout")
            .long("startup-timeout")
            .help("Seconds to wait for a started backend to become healthy")
            .value_name("SECONDS")
            .value_parser(value_parser!(u64)))
        .arg(Arg::new("raw")
            .long("raw")
            .help("Print the model reply untouched")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("snippet")
            .short('s')
            .long("snippet")
            .help("Show the code and copy it to the clipboard instead of saving it")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("justanswer")
            .short('j')
            .long("justanswer")
            .help("Ask a plain question and print the answer")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("append")
            .long("append")
            .help("Append the generated code to FILE")
            .value_name("FILE")
            .value_parser(value_parser!(PathBuf))
            .conflicts_with("edit"))
        .arg(Arg::new("edit")
            .long("edit")
            .help("Rewrite FILE according to the task")
            .value_name("FILE")
            .value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("prompt-file")
            .long("prompt-file")
            .help("Hand-off file for the shell wrapper")
            .value_name("PATH")
            .value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("verbose")
            .short('v')
            .long("verbose")
            .help("Log prompts, replies and timings to stderr")
            .action(ArgAction::SetTrue))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn overrides(matches: &ArgMatches) -> Overrides {
    let string = |id: &str| matches.get_one::<String>(id).cloned();
    Overrides {
        config_path: matches.get_one::<PathBuf>("config").cloned(),
        host: string("host"),
        starter_path: string("starter"),
        model: string("model"),
        mode: string("mode"),
        temperature: matches.get_one::<f64>("temperature").copied(),
        os_string: string("os"),
        timeout_seconds: matches.get_one::<u64>("timeout").copied(),
        max_retries: matches.get_one::<u32>("retries").copied(),
        retry_delay_seconds: matches.get_one::<f64>("retry-delay").copied(),
        startup_timeout_seconds: matches.get_one::<u64>("startup-timeout").copied(),
        output_dir: string("output"),
        system_prompt_override: string("system-prompt"),
        ..Overrides::default()
    }
}

fn invocation(matches: &ArgMatches) -> Invocation {
    let task = matches
        .get_many::<String>("task")
        .unwrap_or_default()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");

    let target = matches
        .get_one::<PathBuf>("append")
        .map(|p| (p.clone(), FileAction::Append))
        .or_else(|| matches.get_one::<PathBuf>("edit").map(|p| (p.clone(), FileAction::Edit)));

    Invocation {
        task,
        options: ClassifyOptions {
            raw: matches.get_flag("raw"),
            just_answer: matches.get_flag("justanswer"),
            snippet: matches.get_flag("snippet"),
        },
        target,
        prompt_file: matches.get_one::<PathBuf>("prompt-file").cloned(),
    }
}

fn fail(err: ShellmandoError) -> ExitCode {
    eprintln!("shellmando: {} error: {}", err.stage(), err);
    ExitCode::from(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Exit status 2 means "script saved", so usage errors must not use it.
    let matches = match cli().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };

    init_logging(matches.get_flag("verbose"));

    let config = match ConfigResolver::from_process().resolve(&overrides(&matches)) {
        Ok(config) => config,
        Err(err) => return fail(err.into()),
    };
    if let Some(path) = &config.source_file {
        info!("Using config file {}", path.display());
    }

    let invocation = invocation(&matches);
    info!("Processing task: {}", invocation.task);

    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr();
    match Orchestrator::new(config).run(&invocation, &mut stdout, &mut stderr).await {
        Ok(routed) => ExitCode::from(routed.outcome.exit_code() as u8),
        Err(err) => fail(err),
    }
}
