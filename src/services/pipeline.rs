use crate::core::config::{Config, ProjectSettings, RateLimitConfig, RetryConfig};
use crate::core::error::{ChunkError, TtsError};
use crate::core::io::Storage;
use crate::core::state::{
    CharacterConfig, CharacterConfigs, DialogueChunk, GeneratedBlob, GenerationProgressState,
    GenerationStatus, ProgressUpdate,
};
use crate::services::concat::{Concatenator, ProductionMetadata};
use crate::services::manifest::{self, ManifestEntry};
use crate::services::parser::collapse_whitespace;
use crate::services::progress::{is_resumable, ProgressStore};
use crate::services::tts::{RateLimitInfo, SynthesisRequest, TtsClient};
use crate::services::validator;
use crate::utils::archive::{build_bundle, BundleEntry};
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Input of one generation run.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub dialogue_chunks: Vec<DialogueChunk>,
    pub character_configs: CharacterConfigs,
    pub settings: ProjectSettings,
    pub production: Option<ProductionMetadata>,
}

/// Where the finished audio ended up, relative to the output storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Individual { files: Vec<String> },
    Combined { filename: String },
    Bundle { filename: String },
}

#[derive(Debug, Clone)]
pub struct GenerationReport {
    /// Chunks enriched with the timings returned by the speech API.
    pub dialogue_chunks: Vec<DialogueChunk>,
    pub blobs: Vec<GeneratedBlob>,
    pub manifest: Vec<ManifestEntry>,
    pub delivery: Delivery,
    pub warnings: Vec<String>,
}

/// Where a failed run can pick up again.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub index: usize,
    pub character: String,
    pub completed: Vec<GeneratedBlob>,
    pub error: ChunkError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationFailure {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Completed(GenerationReport),
    NeedsResume(ResumePoint),
    Cancelled { completed: Vec<GeneratedBlob> },
    Failed(GenerationFailure),
}

#[derive(Default)]
struct RunCounters {
    chunks: u64,
    characters: u64,
}

pub fn chunk_filename(index: usize, character: &str, extension: &str) -> String {
    let name: String = character
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("{:04}_{}.{}", index + 1, name, extension)
}

/// Request for one chunk. Speak-parentheticals mode sends the raw block.
pub fn build_request(
    chunk: &DialogueChunk,
    character: &CharacterConfig,
    settings: &ProjectSettings,
) -> SynthesisRequest {
    let text = if settings.speak_parentheticals {
        collapse_whitespace(&chunk.original_text)
    } else {
        chunk.text.clone()
    };
    SynthesisRequest {
        voice_id: character.voice_id.clone(),
        text,
        model_id: settings.model_id.clone(),
        output_format: settings.output_format.clone(),
        voice_settings: character.voice_settings.clone(),
        language_code: settings.language_code.clone(),
    }
}

/// Waits for `duration`; returns false when cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Sequential, resumable synthesis of a script's dialogue.
pub struct GenerationPipeline {
    tts: Box<dyn TtsClient>,
    concat: Option<Box<dyn Concatenator>>,
    store: ProgressStore,
    output: Arc<dyn Storage>,
    retry: RetryConfig,
    rate_limit: RateLimitConfig,
    user_id: String,
    session_id: String,
    show_progress: bool,
}

impl GenerationPipeline {
    pub fn new(
        config: &Config,
        tts: Box<dyn TtsClient>,
        concat: Option<Box<dyn Concatenator>>,
        store: ProgressStore,
        output: Arc<dyn Storage>,
    ) -> Self {
        Self {
            tts,
            concat,
            store,
            output,
            retry: config.retry.clone(),
            rate_limit: config.rate_limit.clone(),
            user_id: config.user_id.clone(),
            session_id: Utc::now().format("%Y%m%d-%H%M%S").to_string(),
            show_progress: false,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Validates the job and synthesizes it from the first chunk.
    pub async fn run(
        &self,
        job: GenerationJob,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        let validation = validator::validate(
            &job.dialogue_chunks,
            &job.character_configs,
            self.tts.api_key(),
        );
        if !validation.valid {
            warn!("Generation not started: {}", validation.errors.join("; "));
            self.store
                .save(
                    &self.snapshot(&job, 0, GenerationStatus::Error, &validation.errors.join("\n")),
                    &self.user_id,
                )
                .await?;
            self.store
                .record_stats(&self.user_id, |s| {
                    s.runs_failed += 1;
                    s.last_status = Some("error".to_string());
                })
                .await?;
            return Ok(GenerationOutcome::Failed(GenerationFailure {
                errors: validation.errors,
            }));
        }

        self.run_from(job, Vec::new(), cancel).await
    }

    /// Continues the interrupted run persisted for this user.
    pub async fn resume(
        &self,
        production: Option<ProductionMetadata>,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        let Some(state) = self.store.load(&self.user_id).await? else {
            bail!("No interrupted generation found for user {}", self.user_id);
        };
        if !is_resumable(&state) {
            bail!(
                "Stored generation for user {} cannot be resumed (status {:?}, {}/{})",
                self.user_id,
                state.status,
                state.current_index,
                state.total_chunks
            );
        }

        let mut completed = self.store.load_blobs(&self.user_id).await?;
        if completed.len() > state.current_index {
            completed.truncate(state.current_index);
        }
        info!(
            "Resuming generation at chunk {}/{}",
            completed.len() + 1,
            state.total_chunks
        );

        let job = GenerationJob {
            dialogue_chunks: state.dialogue_chunks,
            character_configs: state.character_configs,
            settings: state.project_settings,
            production,
        };
        self.run_from(job, completed, cancel).await
    }

    /// Synthesizes the chunks after `completed`, reusing those blobs as-is.
    pub async fn run_from(
        &self,
        job: GenerationJob,
        mut completed: Vec<GeneratedBlob>,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        let total = job.dialogue_chunks.len();
        let start = completed.len().min(total);
        completed.truncate(start);

        let mut state =
            self.snapshot(&job, start, GenerationStatus::InProgress, "Starting generation");
        state.generated_files = completed.iter().map(|b| b.filename.clone()).collect();
        self.store.save(&state, &self.user_id).await?;
        self.store.save_blobs(&self.user_id, &completed).await?;

        // Reused lines may come from another output directory.
        if !job.settings.concatenate {
            for blob in &completed {
                self.output.write(&blob.filename, &blob.blob).await?;
            }
        }
        self.store
            .record_stats(&self.user_id, |s| {
                s.runs_started += 1;
                s.last_status = Some("in_progress".to_string());
            })
            .await?;

        let pb = if self.show_progress {
            let pb = ProgressBar::new(total as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                    )?
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };
        pb.set_position(start as u64);

        let mut counters = RunCounters::default();
        let extension = job.settings.file_extension().to_string();

        for index in start..total {
            if cancel.is_cancelled() {
                pb.abandon_with_message("Cancelled");
                return self.finish_cancelled(completed).await;
            }

            let chunk = &job.dialogue_chunks[index];
            pb.set_message(chunk.character.clone());
            debug!("Synthesizing chunk {}/{} ({})", index + 1, total, chunk.character);

            let (blob, rate_limit) = match self
                .synthesize_chunk(index, chunk, &job, &extension, cancel)
                .await
            {
                Ok(result) => result,
                Err(e) if e.is_cancellation() => {
                    pb.abandon_with_message("Cancelled");
                    return self.finish_cancelled(completed).await;
                }
                Err(e) => {
                    pb.abandon_with_message("Paused");
                    return self.pause(index, chunk, completed, e).await;
                }
            };

            if !job.settings.concatenate {
                self.output.write(&blob.filename, &blob.blob).await?;
            }
            info!("Generated {}", blob.filename);
            counters.chunks += 1;
            counters.characters += chunk.text.chars().count() as u64;

            let message = format!("Generated {}", blob.filename);
            completed.push(blob);
            self.store.save_blobs(&self.user_id, &completed).await?;
            self.store
                .update(
                    &self.user_id,
                    ProgressUpdate {
                        current_index: Some(index + 1),
                        generated_files: Some(
                            completed.iter().map(|b| b.filename.clone()).collect(),
                        ),
                        last_message: Some(message),
                        ..Default::default()
                    },
                )
                .await?;
            pb.inc(1);

            if index + 1 < total {
                self.cooperate(&rate_limit, job.settings.request_delay_ms, cancel)
                    .await;
            }
        }

        pb.finish_with_message("Synthesis complete");
        self.complete(job, completed, counters).await
    }

    async fn synthesize_chunk(
        &self,
        index: usize,
        chunk: &DialogueChunk,
        job: &GenerationJob,
        extension: &str,
        cancel: &CancellationToken,
    ) -> Result<(GeneratedBlob, RateLimitInfo), ChunkError> {
        let character = job
            .character_configs
            .get(&chunk.character)
            .filter(|c| !c.voice_id.trim().is_empty())
            .ok_or_else(|| ChunkError::MissingVoice(chunk.character.clone()))?;

        let request = build_request(chunk, character, &job.settings);

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TtsError::Cancelled),
                r = self.tts.synthesize(&request) => r,
            };

            match result {
                Ok(response) => {
                    let blob = GeneratedBlob {
                        filename: chunk_filename(index, &chunk.character, extension),
                        start_time_ms: response.start_time_ms(),
                        end_time_ms: response.end_time_ms(),
                        alignment: response.words,
                        blob: response.audio,
                    };
                    return Ok((blob, response.rate_limit));
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt - 1);
                    warn!(
                        "Chunk {} attempt {}/{} failed: {}. Retrying in {:?}",
                        index + 1,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Err(ChunkError::Synthesis {
                            attempts: attempt,
                            source: TtsError::Cancelled,
                        });
                    }
                }
                Err(source) => {
                    return Err(ChunkError::Synthesis {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Backs off when the remaining quota is low, then applies the fixed delay.
    async fn cooperate(&self, info: &RateLimitInfo, delay_ms: u64, cancel: &CancellationToken) {
        if let Some(remaining) = info.remaining {
            if remaining < self.rate_limit.warn_below {
                warn!("Only {} API requests remaining before the rate limit", remaining);
            }
            if remaining < self.rate_limit.pause_below {
                let wait = info
                    .reset_at
                    .and_then(|reset| (reset - Utc::now()).to_std().ok())
                    .filter(|wait| !wait.is_zero());
                if let Some(wait) = wait {
                    info!("Rate limit nearly exhausted, waiting {:?} for reset", wait);
                    if !sleep_or_cancel(wait, cancel).await {
                        return;
                    }
                }
            }
        }
        sleep_or_cancel(Duration::from_millis(delay_ms), cancel).await;
    }

    async fn pause(
        &self,
        index: usize,
        chunk: &DialogueChunk,
        completed: Vec<GeneratedBlob>,
        error: ChunkError,
    ) -> Result<GenerationOutcome> {
        warn!(
            "Generation paused at chunk {} ({}): {}",
            index + 1,
            chunk.character,
            error
        );
        self.store
            .update(
                &self.user_id,
                ProgressUpdate {
                    current_index: Some(index),
                    last_message: Some(format!("Failed at chunk {}: {}", index + 1, error)),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .record_stats(&self.user_id, |s| {
                s.runs_failed += 1;
                s.last_status = Some("error".to_string());
            })
            .await?;

        Ok(GenerationOutcome::NeedsResume(ResumePoint {
            index,
            character: chunk.character.clone(),
            completed,
            error,
        }))
    }

    async fn finish_cancelled(&self, completed: Vec<GeneratedBlob>) -> Result<GenerationOutcome> {
        info!("Generation cancelled after {} chunks", completed.len());
        self.store.clear(&self.user_id).await?;
        self.store
            .record_stats(&self.user_id, |s| {
                s.runs_cancelled += 1;
                s.last_status = Some("cancelled".to_string());
            })
            .await?;
        Ok(GenerationOutcome::Cancelled { completed })
    }

    async fn complete(
        &self,
        job: GenerationJob,
        blobs: Vec<GeneratedBlob>,
        counters: RunCounters,
    ) -> Result<GenerationOutcome> {
        let dialogue_chunks: Vec<DialogueChunk> = job
            .dialogue_chunks
            .iter()
            .zip(&blobs)
            .map(|(chunk, blob)| DialogueChunk {
                start_time_ms: blob.start_time_ms,
                end_time_ms: blob.end_time_ms,
                words: blob.alignment.clone(),
                ..chunk.clone()
            })
            .collect();

        let entries = manifest::build_manifest(&dialogue_chunks, &blobs);
        let manifest_json = manifest::to_json(&entries)?;
        let manifest_csv = manifest::to_csv(&entries)?;
        let extension = job.settings.file_extension();
        let mut warnings = Vec::new();

        let delivery = if job.settings.concatenate {
            match self.concatenate(&blobs, &job).await {
                Ok(audio) => {
                    let filename = format!("{}_combined.{}", self.session_id, extension);
                    self.output.write(&filename, &audio).await?;
                    self.write_manifests(&manifest_json, &manifest_csv).await?;
                    Delivery::Combined { filename }
                }
                Err(e) => {
                    let warning = format!(
                        "Concatenation failed, delivering individual files instead: {:#}",
                        e
                    );
                    warn!("{}", warning);
                    warnings.push(warning);

                    let mut entries: Vec<BundleEntry<'_>> = blobs
                        .iter()
                        .map(|b| BundleEntry {
                            name: &b.filename,
                            data: &b.blob,
                        })
                        .collect();
                    entries.push(BundleEntry {
                        name: "manifest.json",
                        data: manifest_json.as_bytes(),
                    });
                    entries.push(BundleEntry {
                        name: "manifest.csv",
                        data: manifest_csv.as_bytes(),
                    });

                    let filename = format!("{}_bundle.tar.gz", self.session_id);
                    self.output.write(&filename, &build_bundle(&entries)?).await?;
                    Delivery::Bundle { filename }
                }
            }
        } else {
            self.write_manifests(&manifest_json, &manifest_csv).await?;
            Delivery::Individual {
                files: blobs.iter().map(|b| b.filename.clone()).collect(),
            }
        };

        self.store.clear(&self.user_id).await?;
        self.store
            .record_stats(&self.user_id, |s| {
                s.runs_completed += 1;
                s.chunks_generated += counters.chunks;
                s.characters_synthesized += counters.characters;
                s.last_status = Some("completed".to_string());
            })
            .await?;
        info!("Generation complete: {} chunks", blobs.len());

        Ok(GenerationOutcome::Completed(GenerationReport {
            dialogue_chunks,
            blobs,
            manifest: entries,
            delivery,
            warnings,
        }))
    }

    async fn concatenate(&self, blobs: &[GeneratedBlob], job: &GenerationJob) -> Result<Vec<u8>> {
        let concat = self
            .concat
            .as_ref()
            .ok_or_else(|| anyhow!("Concatenation service is not configured"))?;
        concat
            .concatenate(blobs, job.production.as_ref(), &job.settings.output_format)
            .await
    }

    async fn write_manifests(&self, json: &str, csv: &str) -> Result<()> {
        self.output.write("manifest.json", json.as_bytes()).await?;
        self.output.write("manifest.csv", csv.as_bytes()).await
    }

    fn snapshot(
        &self,
        job: &GenerationJob,
        current_index: usize,
        status: GenerationStatus,
        message: &str,
    ) -> GenerationProgressState {
        GenerationProgressState {
            timestamp: Utc::now().timestamp_millis(),
            dialogue_chunks: job.dialogue_chunks.clone(),
            character_configs: job.character_configs.clone(),
            project_settings: job.settings.clone(),
            current_index,
            total_chunks: job.dialogue_chunks.len(),
            status,
            generated_files: Vec::new(),
            last_message: message.to_string(),
        }
    }
}
