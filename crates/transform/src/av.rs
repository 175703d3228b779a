//! Audio/video transform engine.
//!
//! An encode job moves through `Fetching -> Encoding -> Done | Failed`.
//! [`AvEngine::start`] performs the fetch and returns as soon as the
//! encoder is launched, handing back the placeholder asset, a
//! [`JobHandle`] for cancellation and progress, and a [`Completion`]
//! future that settles with the encoded bytes.
//!
//! Scratch files are named by cache key: `{hash}.out.{ext}` for the
//! output and `{hash}.in.{ext}` for buffered inputs. An existing output
//! file means an encode for that key is already running.

use crate::error::{EngineResult, TransformError};
use crate::source::SourceFetcher;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use prism_core::config::TransformConfig;
use prism_core::options::{Bitrate, Dimension};
use prism_core::{AvOptions, CacheKey, MediaFormat, OutputFormat, SourceLocator};
use prism_storage::ByteStream;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Input containers that must be read with seeking, so they are written to
/// scratch instead of piped.
const SEEKABLE_INPUTS: &[&str] = &["gif", "mp4", "m4v", "mov"];

/// Muxer and codec pair for an output container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Codecs {
    pub muxer: &'static str,
    pub video: Option<&'static str>,
    pub audio: Option<&'static str>,
}

/// The codec table. Formats without an entry cannot be encoded.
pub fn codecs_for(format: MediaFormat) -> prism_core::Result<Codecs> {
    let codecs = match format {
        MediaFormat::Mp4 | MediaFormat::M4v => Codecs {
            muxer: "mp4",
            video: Some("libx264"),
            audio: Some("aac"),
        },
        MediaFormat::Webm => Codecs {
            muxer: "webm",
            video: Some("libvpx-vp9"),
            audio: Some("libvorbis"),
        },
        MediaFormat::Ts => Codecs {
            muxer: "mpegts",
            video: Some("libx264"),
            audio: Some("aac"),
        },
        MediaFormat::Mp3 => Codecs {
            muxer: "mp3",
            video: None,
            audio: Some("libmp3lame"),
        },
        MediaFormat::Aac => Codecs {
            muxer: "adts",
            video: None,
            audio: Some("aac"),
        },
        MediaFormat::Weba => Codecs {
            muxer: "webm",
            video: None,
            audio: Some("libvorbis"),
        },
        MediaFormat::Gif => Codecs {
            muxer: "gif",
            video: Some("gif"),
            audio: None,
        },
        // Playlists are multi-file outputs.
        MediaFormat::M3u8 => {
            return Err(prism_core::Error::UnsupportedFormat(
                "m3u8 output cannot be encoded".to_string(),
            ));
        }
        other => {
            return Err(prism_core::Error::UnsupportedFormat(format!(
                "{other:?} is not an audio/video output"
            )));
        }
    };
    Ok(codecs)
}

/// Demuxer to name explicitly when the input arrives on stdin.
fn demuxer_for(ext: &str) -> Option<&'static str> {
    match ext {
        "webm" | "weba" | "mkv" => Some("matroska"),
        "ts" => Some("mpegts"),
        "mp3" => Some("mp3"),
        "aac" => Some("aac"),
        "wav" => Some("wav"),
        "flac" => Some("flac"),
        "ogg" | "oga" => Some("ogg"),
        "avi" => Some("avi"),
        _ => None,
    }
}

/// Everything needed to assemble an encoder command line.
#[derive(Debug)]
pub struct EncodeSpec<'a> {
    pub options: &'a AvOptions,
    pub codecs: Codecs,
    pub input: &'a str,
    pub demuxer: Option<&'static str>,
    pub output: &'a Path,
    pub default_video_bitrate: &'a str,
    pub default_audio_bitrate: &'a str,
    pub faststart: bool,
}

impl EncodeSpec<'_> {
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-y",
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostats",
            "-progress",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if let Some(demuxer) = self.demuxer {
            args.extend(["-f".to_string(), demuxer.to_string()]);
        }
        args.extend(["-i".to_string(), self.input.to_string()]);

        if let Some(seek) = &self.options.seek {
            args.extend(["-ss".to_string(), seek.clone()]);
        }
        if let Some(duration) = &self.options.duration {
            args.extend(["-t".to_string(), duration.clone()]);
        }

        match (self.codecs.video, &self.options.video_bitrate) {
            (None, _) | (_, Some(Bitrate::Drop)) => args.push("-vn".to_string()),
            (Some(codec), bitrate) => {
                args.extend(["-c:v".to_string(), codec.to_string()]);
                if codec != "gif" {
                    let rate = match bitrate {
                        Some(Bitrate::Rate(rate)) => rate.as_str(),
                        _ => self.default_video_bitrate,
                    };
                    args.extend(["-b:v".to_string(), rate.to_string()]);
                    args.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
                }
                args.extend(["-vf".to_string(), self.video_filter()]);
            }
        }

        match (self.codecs.audio, &self.options.audio_bitrate) {
            (None, _) | (_, Some(Bitrate::Drop)) => args.push("-an".to_string()),
            (Some(codec), bitrate) => {
                let rate = match bitrate {
                    Some(Bitrate::Rate(rate)) => rate.as_str(),
                    _ => self.default_audio_bitrate,
                };
                args.extend(["-c:a".to_string(), codec.to_string()]);
                args.extend(["-b:a".to_string(), rate.to_string()]);
                if !self.options.audio_filters.is_empty() {
                    args.extend(["-af".to_string(), self.options.audio_filters.join(",")]);
                }
            }
        }

        if self.faststart {
            args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        }

        args.extend(["-f".to_string(), self.codecs.muxer.to_string()]);
        args.push(self.output.to_string_lossy().into_owned());
        args
    }

    /// yuv420p needs even dimensions.
    fn video_filter(&self) -> String {
        if self.options.width.is_none() && self.options.height.is_none() {
            return "crop=floor(in_w/2)*2:floor(in_h/2)*2".to_string();
        }
        let side = |dim: Option<Dimension>, axis: &str| match dim {
            Some(Dimension::Pixels(px)) => ((px / 2) * 2).max(2).to_string(),
            Some(Dimension::Fraction(f)) => format!("trunc({axis}*{f}/2)*2"),
            None => "-2".to_string(),
        };
        format!(
            "scale={}:{}",
            side(self.options.width, "iw"),
            side(self.options.height, "ih")
        )
    }
}

/// One progress tick from the encoder.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Progress {
    pub out_time: Option<String>,
    pub frame: Option<u64>,
    pub speed: Option<String>,
    pub done: bool,
}

impl Progress {
    /// Fold one `key=value` line of `-progress` output into this tick.
    /// Returns true when the line closes a block.
    pub fn apply(&mut self, line: &str) -> bool {
        let Some((key, value)) = line.trim().split_once('=') else {
            return false;
        };
        match key {
            "out_time" => self.out_time = Some(value.to_string()),
            "frame" => self.frame = value.parse().ok(),
            "speed" => self.speed = Some(value.trim().to_string()),
            "progress" => {
                self.done = value == "end";
                return true;
            }
            _ => {}
        }
        false
    }
}

/// A command handed to an [`EncodeRunner`].
pub struct EncodeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Source bytes to pipe into stdin, when the input is not a file.
    pub stdin: Option<ByteStream>,
    pub output: PathBuf,
}

/// Runs encoder commands.
#[async_trait]
pub trait EncodeRunner: Send + Sync + 'static {
    /// Run to completion, publishing progress ticks. Must stop the encoder
    /// and return an error once `cancel` fires.
    async fn run(
        &self,
        command: EncodeCommand,
        progress: watch::Sender<Progress>,
        cancel: CancellationToken,
    ) -> EngineResult<()>;
}

/// Runs the system `ffmpeg` binary.
#[derive(Debug, Default)]
pub struct FfmpegRunner;

#[async_trait]
impl EncodeRunner for FfmpegRunner {
    async fn run(
        &self,
        command: EncodeCommand,
        progress: watch::Sender<Progress>,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(if command.stdin.is_some() {
                std::process::Stdio::piped()
            } else {
                std::process::Stdio::null()
            })
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(program = %command.program.display(), args = ?command.args, "Starting encoder");
        let mut child = cmd.spawn().map_err(|e| {
            TransformError::Encode(format!(
                "failed to spawn {}: {e}",
                command.program.display()
            ))
        })?;

        let feeder = match (command.stdin, child.stdin.take()) {
            (Some(mut source), Some(mut pipe)) => Some(tokio::spawn(async move {
                while let Some(chunk) = source.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            tracing::warn!(error = %e, "Source stream failed mid-encode");
                            break;
                        }
                    };
                    // The encoder may stop reading early, e.g. once a duration is reached.
                    if pipe.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
            })),
            _ => None,
        };

        let ticks = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut current = Progress::default();
                while let Ok(Some(line)) = lines.next_line().await {
                    if current.apply(&line) {
                        progress.send_replace(current.clone());
                    }
                }
            })
        });

        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                if let Some(feeder) = feeder {
                    feeder.abort();
                }
                return Err(TransformError::Encode("encode cancelled".to_string()));
            }
        };

        if let Some(feeder) = feeder {
            feeder.abort();
        }
        if let Some(ticks) = ticks {
            let _ = ticks.await;
        }
        let stderr = match stderr {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(TransformError::Encode(format!(
                "ffmpeg exited with {status}: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Cancellation and progress for a running encode.
#[derive(Clone, Debug)]
pub struct JobHandle {
    cancel: CancellationToken,
    progress: watch::Receiver<Progress>,
}

impl JobHandle {
    /// Stop the encoder. The completion future then fails.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Guard that kills the job when dropped unless disarmed.
    pub fn kill_on_drop(&self) -> KillOnDrop {
        KillOnDrop {
            handle: Some(self.clone()),
        }
    }
}

/// Kills the attached job on drop, e.g. when a client disconnects mid-response.
#[derive(Debug)]
pub struct KillOnDrop {
    handle: Option<JobHandle>,
}

impl KillOnDrop {
    pub fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && !handle.is_killed()
        {
            tracing::debug!("Client went away, killing encode");
            handle.kill();
        }
    }
}

/// Settles with the encoded bytes once the job is done.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<EngineResult<Bytes>>);

impl Future for Completion {
    type Output = EngineResult<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(TransformError::Encode(
                    "encode task ended without a result".to_string(),
                ))
            })
        })
    }
}

/// A launched encode.
#[derive(Debug)]
pub struct EncodeJob {
    pub handle: JobHandle,
    pub completion: Completion,
}

/// What an AV request returns right away.
#[derive(Debug)]
pub struct PendingEncode {
    pub placeholder: Bytes,
    /// `None` when an encode for the same key was already running.
    pub job: Option<EncodeJob>,
}

/// Fixed settings for the AV engine.
#[derive(Clone, Debug)]
pub struct AvConfig {
    pub scratch_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub min_output_bytes: u64,
    pub default_video_bitrate: String,
    pub default_audio_bitrate: String,
}

impl From<&TransformConfig> for AvConfig {
    fn from(config: &TransformConfig) -> Self {
        Self {
            scratch_dir: config.scratch_dir.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            min_output_bytes: config.min_output_bytes,
            default_video_bitrate: config.default_video_bitrate.clone(),
            default_audio_bitrate: config.default_audio_bitrate.clone(),
        }
    }
}

/// Launches encode jobs.
pub struct AvEngine {
    config: AvConfig,
    sources: SourceFetcher,
    runner: Arc<dyn EncodeRunner>,
    placeholder: Bytes,
    active: Arc<AtomicUsize>,
}

impl AvEngine {
    /// Prepare the scratch directory, clearing files left by a previous run.
    pub async fn open(
        config: AvConfig,
        sources: SourceFetcher,
        runner: Arc<dyn EncodeRunner>,
        placeholder: Bytes,
    ) -> EngineResult<Self> {
        tokio::fs::create_dir_all(&config.scratch_dir).await?;

        let mut stale = 0usize;
        let mut entries = tokio::fs::read_dir(&config.scratch_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if (name.contains(".out.") || name.contains(".in."))
                && tokio::fs::remove_file(entry.path()).await.is_ok()
            {
                stale += 1;
            }
        }
        if stale > 0 {
            tracing::info!(
                scratch_dir = %config.scratch_dir.display(),
                removed = stale,
                "Removed stale encode scratch files"
            );
        }

        Ok(Self {
            config,
            sources,
            runner,
            placeholder,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Encodes currently running.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn placeholder(&self) -> &Bytes {
        &self.placeholder
    }

    fn scratch_path(&self, key: &CacheKey, role: &str, ext: &str) -> PathBuf {
        self.config
            .scratch_dir
            .join(format!("{}.{role}.{ext}", key.hash_hex()))
    }

    /// Fetch the source and launch the encode.
    pub async fn start(
        &self,
        key: &CacheKey,
        source: &SourceLocator,
        format: &OutputFormat,
        options: &AvOptions,
    ) -> EngineResult<PendingEncode> {
        let codecs = codecs_for(format.format())?;
        let output = self.scratch_path(key, "out", format.extension());

        // Claim the output path; losing the race means a job already runs.
        let claim = match ScratchFile::create_new(&output).await {
            Ok(claim) => claim,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(key = %key, "Encode already in progress, serving placeholder");
                return Ok(PendingEncode {
                    placeholder: self.placeholder.clone(),
                    job: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        // Dropping the claim (error or a caller that goes away mid-fetch)
        // frees the key again.
        let input_ext = source.extension().unwrap_or_default();
        let (input_file, stdin) = self.fetch_input(key, source, &input_ext).await?;

        let input_arg = match &input_file {
            Some(path) => path.to_string_lossy().into_owned(),
            None => "pipe:0".to_string(),
        };
        let spec = EncodeSpec {
            options,
            codecs,
            input: &input_arg,
            demuxer: if input_file.is_none() {
                demuxer_for(&input_ext)
            } else {
                None
            },
            output: &output,
            default_video_bitrate: &self.config.default_video_bitrate,
            default_audio_bitrate: &self.config.default_audio_bitrate,
            faststart: codecs.muxer == "mp4",
        };
        let command = EncodeCommand {
            program: self.config.ffmpeg_path.clone(),
            args: spec.args(),
            stdin,
            output: output.clone(),
        };

        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        let (done_tx, done_rx) = oneshot::channel();

        let runner = self.runner.clone();
        let active = self.active.clone();
        let min_output_bytes = self.config.min_output_bytes;
        let job_key = key.clone();
        let job_cancel = cancel.clone();
        active.fetch_add(1, Ordering::Relaxed);
        tracing::info!(key = %key, source = %source, format = %format, "Encode started");

        claim.keep();
        tokio::spawn(async move {
            let run = runner.run(command, progress_tx, job_cancel).await;
            let outcome = collect_output(run, &output, input_file.as_deref(), min_output_bytes).await;
            active.fetch_sub(1, Ordering::Relaxed);
            match &outcome {
                Ok(bytes) => tracing::info!(key = %job_key, size = bytes.len(), "Encode finished"),
                Err(e) => tracing::error!(key = %job_key, error = %e, "Encode failed"),
            }
            // The receiver may be gone if nobody waits for the result.
            let _ = done_tx.send(outcome);
        });

        Ok(PendingEncode {
            placeholder: self.placeholder.clone(),
            job: Some(EncodeJob {
                handle: JobHandle {
                    cancel,
                    progress: progress_rx,
                },
                completion: Completion(done_rx),
            }),
        })
    }

    /// Seekable containers are buffered to scratch; others stream to stdin.
    async fn fetch_input(
        &self,
        key: &CacheKey,
        source: &SourceLocator,
        input_ext: &str,
    ) -> EngineResult<(Option<PathBuf>, Option<ByteStream>)> {
        if SEEKABLE_INPUTS.contains(&input_ext) {
            let bytes = self.sources.fetch(source).await?;
            let path = self.scratch_path(key, "in", input_ext);
            let input = ScratchFile::armed(path.clone());
            tokio::fs::write(&path, &bytes).await?;
            input.keep();
            Ok((Some(path), None))
        } else {
            let (_, stream) = self.sources.open(source).await?;
            Ok((None, Some(stream)))
        }
    }
}

/// Read back the finished output and clear scratch files.
async fn collect_output(
    run: EngineResult<()>,
    output: &Path,
    input: Option<&Path>,
    min_output_bytes: u64,
) -> EngineResult<Bytes> {
    let result = match run {
        Ok(()) => tokio::fs::read(output)
            .await
            .map_err(TransformError::from)
            .and_then(|data| {
                if (data.len() as u64) < min_output_bytes {
                    Err(TransformError::Encode(format!(
                        "result too small ({} bytes)",
                        data.len()
                    )))
                } else {
                    Ok(Bytes::from(data))
                }
            }),
        Err(e) => Err(e),
    };

    remove_quietly(output).await;
    if let Some(input) = input {
        remove_quietly(input).await;
    }
    result
}

/// A scratch file removed on drop unless kept.
struct ScratchFile {
    path: Option<PathBuf>,
}

impl ScratchFile {
    fn armed(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    async fn create_new(path: &Path) -> std::io::Result<Self> {
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        Ok(Self::armed(path.to_path_buf()))
    }

    /// Hand the file over to whoever cleans it up next.
    fn keep(mut self) {
        self.path = None;
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn remove_quietly(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}
