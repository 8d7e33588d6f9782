use futures::future::BoxFuture;
use log::debug;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::config::TranscoderConfig;
use crate::metadata::ResolvedMetadata;

/// Byte source carrying the transcoded stream
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Control over a running transcoder
pub trait TranscoderProcess: Send {
    /// Resolve with the exit code once the process ends
    ///
    /// Must be cancel safe: the supervisor races it against kill requests.
    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<Option<i32>>>;

    /// Request termination without waiting for it
    fn start_kill(&mut self) -> std::io::Result<()>;
}

/// A freshly started transcoder: its output and its process handle
pub struct SpawnedTranscoder {
    pub output: ProcessOutput,
    pub process: Box<dyn TranscoderProcess>,
}

/// Starts transcoder processes tagged with the given metadata
pub trait Transcoder: Send + Sync {
    fn spawn(&self, metadata: &ResolvedMetadata) -> std::io::Result<SpawnedTranscoder>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Runs an external program (ffmpeg by default) and reads its stdout
pub struct CommandTranscoder {
    program: String,
    args: Vec<String>,
    input_url: String,
}

impl CommandTranscoder {
    pub fn new(config: &TranscoderConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            input_url: config.input_url.clone(),
        }
    }

    /// Argument list with placeholders replaced
    ///
    /// Supported: {input}, {title}, {artist}, {comment}, {genre}, {artwork}.
    pub fn render_args(&self, metadata: &ResolvedMetadata) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &self.input_url)
                    .replace("{title}", &metadata.title)
                    .replace("{artist}", &metadata.artist)
                    .replace("{comment}", &metadata.comment)
                    .replace("{genre}", &metadata.genre)
                    .replace("{artwork}", &metadata.artwork)
            })
            .collect()
    }
}

impl Transcoder for CommandTranscoder {
    fn spawn(&self, metadata: &ResolvedMetadata) -> std::io::Result<SpawnedTranscoder> {
        let mut child = Command::new(&self.program)
            .args(self.render_args(metadata))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "transcoder stdout not captured")
        })?;

        if let Some(stderr) = child.stderr.take() {
            let pid = child.id();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("transcoder[{}]: {}", pid.unwrap_or_default(), line);
                }
            });
        }

        Ok(SpawnedTranscoder {
            output: Box::new(stdout),
            process: Box::new(ChildProcess { child }),
        })
    }

    fn describe(&self) -> String {
        format!("{} <- {}", self.program, self.input_url)
    }
}

struct ChildProcess {
    child: Child,
}

impl TranscoderProcess for ChildProcess {
    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<Option<i32>>> {
        Box::pin(async move { self.child.wait().await.map(|status| status.code()) })
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}
