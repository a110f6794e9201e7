//! Operator CLI for the practice pipeline

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use practice::logging::{self, LogFormat};
use practice::providers::{ProviderContext, StructuredTask};
use practice::{
    AiMode, Caller, Exercise, HttpProviderFactory, PracticeRunner, PracticeStore, ProviderFactory,
    RuntimeConfig, Storage, vault,
};

#[derive(Parser)]
#[command(
    name = "practice",
    version,
    about = "Transcribe, score and store deliberate-practice attempts"
)]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "DB_PATH", default_value = "./practice.db", global = true)]
    db: PathBuf,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text", global = true)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline on a JSON request body (file or stdin)
    Run {
        #[arg(long)]
        user: String,
        /// Request body file; reads stdin when omitted or `-`
        #[arg(long)]
        input: Option<PathBuf>,
        /// Include timings and chosen providers in the response
        #[arg(long)]
        debug: bool,
    },
    /// Create an empty attempt for later runs
    StartAttempt {
        #[arg(long)]
        user: String,
        #[arg(long)]
        exercise: String,
    },
    /// List a user's attempts
    ListAttempts {
        #[arg(long)]
        user: String,
        #[arg(long)]
        exercise: Option<String>,
    },
    /// Import an exercise from JSON, or from free text via the cloud LLM
    ImportExercise {
        file: PathBuf,
        /// Treat the file as free text and structure it with the cloud LLM
        #[arg(long)]
        from_text: bool,
        /// Exercise id for text imports (defaults to the slug)
        #[arg(long)]
        id: Option<String>,
    },
    /// Encrypt and store a user's vendor API key
    SetKey {
        #[arg(long)]
        user: String,
        #[arg(long, env = "PRACTICE_USER_API_KEY", hide_env_values = true)]
        key: String,
    },
    /// Remove a user's stored API key
    ClearKey {
        #[arg(long)]
        user: String,
    },
    /// Check a key against the vendor; uses the stored key when none is given
    ValidateKey {
        #[arg(long)]
        user: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Set a user's routing mode (`default` clears it)
    SetMode {
        #[arg(long)]
        user: String,
        mode: String,
    },
    /// Override a user's local backend URLs (omit a flag to clear it)
    SetEndpoints {
        #[arg(long)]
        user: String,
        #[arg(long)]
        stt_url: Option<String>,
        #[arg(long)]
        llm_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(match cli.log_format {
        LogFormatArg::Text => LogFormat::Text,
        LogFormatArg::Json => LogFormat::Json,
    });

    let config = RuntimeConfig::from_env().context("invalid configuration")?;
    let storage = Arc::new(
        Storage::open(&cli.db).with_context(|| format!("failed to open {}", cli.db.display()))?,
    );
    let factory = Arc::new(HttpProviderFactory::from_config(&config));

    match cli.cmd {
        Command::Run { user, input, debug } => {
            let body = read_input(input.as_deref())?;
            let store: Arc<dyn PracticeStore> = storage.clone();
            let runner = PracticeRunner::new(config, store, factory);
            let reply = runner.run(&Caller::new(user).with_debug(debug), &body).await;
            eprintln!("status: {}", reply.status);
            print_json(&reply.body)?;
            if reply.status != 200 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::StartAttempt { user, exercise } => {
            let attempt = storage.start_attempt(&user, &exercise)?;
            print_json(&serde_json::json!({ "attempt_id": attempt.id }))?;
        }
        Command::ListAttempts { user, exercise } => {
            let attempts = storage.list_attempts(&user, exercise.as_deref())?;
            print_json(&attempts)?;
        }
        Command::ImportExercise { file, from_text, id } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let exercise = if from_text {
                structure_exercise(&config, factory.as_ref(), &text, id).await?
            } else {
                serde_json::from_str::<Exercise>(&text).context("exercise file is not valid JSON")?
            };
            storage.save_exercise(&exercise)?;
            info!(exercise_id = %exercise.id, "Exercise imported");
            print_json(&exercise)?;
        }
        Command::SetKey { user, key } => {
            let Some(secret) = config.encryption_secret.as_deref() else {
                bail!("OPENAI_KEY_ENCRYPTION_SECRET is not configured");
            };
            let key = key.trim();
            if key.is_empty() {
                bail!("API key is empty");
            }
            storage.set_credential(&user, vault::encrypt(secret, key)?)?;
            print_json(&serde_json::json!({ "ok": true, "hasKey": true }))?;
        }
        Command::ClearKey { user } => {
            storage.clear_credential(&user)?;
            print_json(&serde_json::json!({ "ok": true, "hasKey": false }))?;
        }
        Command::ValidateKey { user, key } => {
            let store: Arc<dyn PracticeStore> = storage.clone();
            let runner = PracticeRunner::new(config, store, factory);
            let result = runner
                .validate_key(&user, key.as_deref())
                .await
                .map_err(|e| anyhow::anyhow!("{} (HTTP {})", e.message, e.http_status()))?;
            print_json(&result)?;
            if !result.ok {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::SetMode { user, mode } => {
            let mode = match mode.as_str() {
                "default" => None,
                other => Some(
                    AiMode::parse(other)
                        .with_context(|| format!("unknown mode {other:?}"))?,
                ),
            };
            storage.set_ai_mode(&user, mode)?;
            print_json(&serde_json::json!({ "ok": true, "ai_mode": mode }))?;
        }
        Command::SetEndpoints {
            user,
            stt_url,
            llm_url,
        } => {
            storage.set_local_endpoints(&user, stt_url, llm_url)?;
            print_json(&serde_json::json!({ "ok": true }))?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        _ => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("failed to read stdin")?;
            Ok(body)
        }
    }
}

async fn structure_exercise(
    config: &RuntimeConfig,
    factory: &HttpProviderFactory,
    text: &str,
    id: Option<String>,
) -> Result<Exercise> {
    if config.default_api_key.is_none() {
        bail!("OPENAI_API_KEY is required to structure free-text exercises");
    }
    let ctx = ProviderContext {
        local_stt_url: config.local_stt_url.clone(),
        local_llm_url: config.local_llm_url.clone(),
        api_key: config.default_api_key.clone(),
    };
    let pair = factory.llm_providers(&ctx)?;
    let task: StructuredTask = pair.cloud.parse_source_text(text).await?;
    let mut exercise = task.into_exercise(id.unwrap_or_default());
    if exercise.id.is_empty() {
        exercise.id = exercise.slug.clone();
    }
    Ok(exercise)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
