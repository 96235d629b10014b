use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, warn};
use script2audio::core::config::{Config, ProjectConfig, ProjectSettings};
use script2audio::core::error::{describe_chunk_error, describe_tts_error, describe_validation_errors};
use script2audio::core::io::{NativeStorage, Storage};
use script2audio::services::concat::{Concatenator, HttpConcatClient, ProductionMetadata};
use script2audio::services::parser::{self, ParsedScript};
use script2audio::services::pipeline::{
    build_request, Delivery, GenerationJob, GenerationOutcome, GenerationPipeline,
};
use script2audio::services::progress::{self, ProgressStore, StorageKey};
use script2audio::services::tts::create_tts_client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "script2audio", version, about = "Voice screenplay dialogue line by line")]
struct Cli {
    /// Screenplay text files to voice, in order
    scripts: Vec<PathBuf>,

    /// Project file with character voices and generation settings (JSON)
    #[arg(short, long)]
    project: Option<PathBuf>,

    /// Output directory (overrides config.yml)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Delay between requests in milliseconds
    #[arg(long)]
    delay: Option<u64>,

    /// Join the generated lines into one file via the concatenation service
    #[arg(long)]
    concatenate: bool,

    #[arg(long, env = "ELEVENLABS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// User id scoping the saved progress
    #[arg(long)]
    user: Option<String>,

    /// Resume the interrupted generation without asking
    #[arg(long)]
    resume: bool,

    /// Never prompt
    #[arg(long)]
    unattended: bool,

    /// Check the API key and exit
    #[arg(long)]
    check_key: bool,

    /// Synthesize one sample line per character instead of the full script
    #[arg(long)]
    preview: bool,
}

fn session_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "script".to_string())
}

fn print_diagnostics(path: &Path, parsed: &ParsedScript) {
    println!(
        "{}: {} characters, {} dialogue lines",
        path.display(),
        parsed.characters.len(),
        parsed.dialogue_chunks.len()
    );
    if !parsed.diagnostics.unmatched_lines.is_empty() {
        println!(
            "  {} lines could not be attributed to a speaker",
            parsed.diagnostics.unmatched_lines.len()
        );
        for line in &parsed.diagnostics.unmatched_lines {
            debug!("Unmatched line {}: {}", line.line_number, line.content);
        }
    }
    for collision in &parsed.diagnostics.alias_collisions {
        println!(
            "  Alias {} refers to {} (also matches {})",
            collision.alias, collision.kept, collision.shadowed
        );
    }
}

struct App {
    config: Config,
    api_key: String,
    store: ProgressStore,
    cancel: CancellationToken,
}

impl App {
    async fn pipeline(&self, output_dir: &Path, session: &str) -> Result<GenerationPipeline> {
        let tts = create_tts_client(&self.config, &self.api_key)?;
        let concat: Option<Box<dyn Concatenator>> = if self.config.concat.enabled {
            let client = HttpConcatClient::new(
                &self.config.concat.base_url,
                Duration::from_secs(self.config.api.request_timeout_seconds),
            )?;
            Some(Box::new(client))
        } else {
            None
        };
        let output: Arc<dyn Storage> = Arc::new(NativeStorage::new(output_dir));
        Ok(GenerationPipeline::new(&self.config, tts, concat, self.store.clone(), output)
            .with_session_id(session)
            .with_progress_bar(true))
    }

    /// Prints the outcome; returns whether processing should go on.
    fn report(&self, outcome: GenerationOutcome, output_dir: &Path) -> Result<bool> {
        match outcome {
            GenerationOutcome::Completed(report) => {
                for warning in &report.warnings {
                    eprintln!("Warning: {}", warning);
                }
                match report.delivery {
                    Delivery::Individual { files } => {
                        println!("Wrote {} files to {}", files.len(), output_dir.display())
                    }
                    Delivery::Combined { filename } | Delivery::Bundle { filename } => {
                        println!("Wrote {}", output_dir.join(filename).display())
                    }
                }
                Ok(true)
            }
            GenerationOutcome::Cancelled { completed } => {
                println!("Generation cancelled after {} lines.", completed.len());
                Ok(false)
            }
            GenerationOutcome::NeedsResume(point) => {
                eprintln!("{}", describe_chunk_error(&point.error));
                eprintln!(
                    "Stopped at line {} ({}). Run again with --resume to continue.",
                    point.index + 1,
                    point.character
                );
                bail!("Generation paused at line {}", point.index + 1)
            }
            GenerationOutcome::Failed(failure) => {
                eprintln!("{}", describe_validation_errors(&failure.errors));
                bail!("Generation could not start")
            }
        }
    }

    async fn check_key(&self) -> Result<()> {
        let tts = create_tts_client(&self.config, &self.api_key)?;
        match tts.validate_api_key().await {
            Ok(status) if status.valid => {
                println!("API key is valid.");
                Ok(())
            }
            Ok(status) => bail!(
                "API key rejected (HTTP {}): {}",
                status.status.unwrap_or_default(),
                status.message.unwrap_or_default()
            ),
            Err(e) => {
                eprintln!("{}", describe_tts_error(&e));
                Err(e.into())
            }
        }
    }

    async fn preview(
        &self,
        parsed: &ParsedScript,
        project: &ProjectConfig,
        settings: &ProjectSettings,
        output_dir: &Path,
    ) -> Result<()> {
        let tts = create_tts_client(&self.config, &self.api_key)?;
        let output = NativeStorage::new(output_dir);
        for name in &parsed.characters {
            let Some(chunk) = parsed.dialogue_chunks.iter().find(|c| &c.character == name) else {
                continue;
            };
            let Some(character) = project.character_configs.get(name) else {
                println!("Skipping {}: no voice configured", name);
                continue;
            };
            let audio = tts
                .synthesize_preview(&build_request(chunk, character, settings))
                .await
                .map_err(|e| {
                    eprintln!("{}", describe_tts_error(&e));
                    e
                })?;
            let filename = format!(
                "preview_{}.{}",
                name.replace(|c: char| !c.is_alphanumeric(), "_"),
                settings.file_extension()
            );
            output.write(&filename, &audio).await?;
            println!("Wrote {}", output_dir.join(filename).display());
        }
        Ok(())
    }

    async fn resume_if_wanted(
        &self,
        force: bool,
        production: Option<ProductionMetadata>,
    ) -> Result<bool> {
        let user = &self.config.user_id;
        let Some(state) = self.store.load(user).await? else {
            return Ok(false);
        };
        if !progress::is_resumable(&state) {
            return Ok(false);
        }

        let wanted = force
            || (!self.config.unattended
                && inquire::Confirm::new(&format!(
                    "An interrupted generation is {}% done ({}/{} lines). Resume it?",
                    progress::progress_percentage(&state),
                    state.current_index,
                    state.total_chunks
                ))
                .with_default(true)
                .prompt()
                .unwrap_or(false));
        if !wanted {
            return Ok(false);
        }

        let output_dir = PathBuf::from(&self.config.output_folder).join("resumed");
        let pipeline = self.pipeline(&output_dir, "resumed").await?;
        let outcome = pipeline.resume(production, &self.cancel).await?;
        self.report(outcome, &output_dir)?;
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(user) = &cli.user {
        config.user_id = user.clone();
    }
    if let Some(output) = &cli.output {
        config.output_folder = output.to_string_lossy().to_string();
    }
    config.unattended |= cli.unattended;
    config.ensure_directories()?;

    let api_key = config.resolve_api_key(cli.api_key.as_deref()).unwrap_or_default();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nCancelling after the current request...");
                cancel.cancel();
            }
        });
    }

    let state_storage: Arc<dyn Storage> = Arc::new(NativeStorage::new(&config.state_folder));
    let store = ProgressStore::new(
        state_storage,
        Duration::from_secs(config.progress_ttl_hours * 3600),
    );
    let app = App {
        config,
        api_key,
        store,
        cancel,
    };

    if cli.check_key {
        return app.check_key().await;
    }

    let project = match &cli.project {
        Some(path) => ProjectConfig::load(path)?,
        None => ProjectConfig::default(),
    };
    let mut settings = project.project_settings.clone();
    if let Some(delay) = cli.delay {
        settings.request_delay_ms = delay;
    }
    settings.concatenate |= cli.concatenate;

    let production = match &project.production {
        Some(production) => Some(ProductionMetadata::load(production).await?),
        None => None,
    };

    if !cli.preview && app.resume_if_wanted(cli.resume, production.clone()).await? {
        return Ok(());
    }
    if cli.resume {
        bail!("No interrupted generation to resume");
    }
    if cli.scripts.is_empty() {
        bail!("No script files given");
    }

    if settings.concatenate && app.config.concat.enabled {
        let probe = HttpConcatClient::new(&app.config.concat.base_url, Duration::from_secs(5))?;
        if !probe.health().await.unwrap_or(false) {
            warn!("Concatenation service at {} is not responding", app.config.concat.base_url);
            println!("Concatenation service unavailable; files will be bundled instead.");
        }
    }

    for path in &cli.scripts {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        app.store
            .save_text(StorageKey::ScriptText, &app.config.user_id, &text)
            .await?;

        let parsed = parser::parse(&text);
        print_diagnostics(path, &parsed);

        let session = session_name(path);
        let output_dir = PathBuf::from(&app.config.output_folder).join(&session);

        if cli.preview {
            app.preview(&parsed, &project, &settings, &output_dir).await?;
            continue;
        }

        let job = GenerationJob {
            dialogue_chunks: parsed.dialogue_chunks,
            character_configs: project.character_configs.clone(),
            settings: settings.clone(),
            production: production.clone(),
        };
        let pipeline = app.pipeline(&output_dir, &session).await?;
        let outcome = pipeline.run(job, &app.cancel).await?;
        if !app.report(outcome, &output_dir)? {
            break;
        }
    }

    Ok(())
}
