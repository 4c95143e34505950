use crate::config::{ConfigError, HubConfig, TtsSelection};
use sha2::{Digest, Sha256};
use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const DEFAULT_EMOTION: &str = "neutral";

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("synthesis engine failed: {0}")]
    Engine(String),
    #[error("synthesis io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("synthesis timed out after {0:?}")]
    Timeout(Duration),
    #[error("synthesis worker failed: {0}")]
    Worker(String),
    #[error("synthesis pool is shut down")]
    PoolClosed,
}

/// Text-to-speech capability the hub attaches audio with.
///
/// Implementations block; the hub only calls them from its worker pool.
pub trait SpeechSynthesizer: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn generate(&self, text: &str, emotion: &str) -> Result<PathBuf, TtsError>;

    fn generate_with_emotion(&self, text: &str, emotion: &str) -> Result<PathBuf, TtsError> {
        self.generate(text, emotion)
    }
}

/// Bounded worker pool in front of a [`SpeechSynthesizer`].
pub struct TtsBridge {
    synth: Arc<dyn SpeechSynthesizer>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl TtsBridge {
    pub fn new(synth: Arc<dyn SpeechSynthesizer>, workers: usize, timeout: Duration) -> Self {
        Self {
            synth,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    pub fn engine(&self) -> &str {
        self.synth.name()
    }

    /// Runs synthesis on a blocking worker. The deadline covers waiting for a
    /// free worker as well as the engine call.
    pub async fn synthesize(&self, text: &str, emotion: Option<&str>) -> Result<PathBuf, TtsError> {
        let permits = self.permits.clone();
        let synth = self.synth.clone();
        let text = text.to_string();
        let emotion = emotion
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let job = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| TtsError::PoolClosed)?;
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                match emotion {
                    Some(emotion) => synth.generate_with_emotion(&text, &emotion),
                    None => synth.generate(&text, DEFAULT_EMOTION),
                }
            });
            handle
                .await
                .map_err(|err| TtsError::Worker(err.to_string()))?
        };
        match tokio::time::timeout(self.timeout, job).await {
            Ok(result) => result,
            Err(_) => Err(TtsError::Timeout(self.timeout)),
        }
    }

    /// Refuses new jobs. Workers already running finish on their own; the
    /// runtime's shutdown timeout bounds how long they are waited for.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Runs an external program per utterance.
///
/// Arguments may contain `{output}`, `{emotion}` and `{text}` placeholders;
/// the text is also written to the program's stdin. Artifacts are named by a
/// hash of text and emotion and reused when already present. A run that
/// outlives `deadline` is killed so its worker is released.
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    output_dir: PathBuf,
    deadline: Duration,
}

impl CommandSynthesizer {
    pub fn new(program: String, args: Vec<String>, output_dir: PathBuf, deadline: Duration) -> Self {
        Self {
            program,
            args,
            output_dir,
            deadline,
        }
    }

    pub fn artifact_path(&self, text: &str, emotion: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.wav", artifact_stem(text, emotion)))
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn name(&self) -> &str {
        "command"
    }

    fn generate(&self, text: &str, emotion: &str) -> Result<PathBuf, TtsError> {
        let output = self.artifact_path(text, emotion);
        if output.exists() {
            debug!(event = "tts_cache_hit", path = %output.display());
            return Ok(output);
        }
        std::fs::create_dir_all(&self.output_dir)?;

        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| expand_placeholders(arg, &output, emotion, text))
            .collect();
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        // Stdin and stderr are serviced on their own threads so an engine may
        // fill either pipe in any order. Engines that take text from arguments
        // may exit without reading stdin; the exit status decides success.
        let feeder = child.stdin.take().map(|mut stdin| {
            let input = text.as_bytes().to_vec();
            thread::spawn(move || {
                let _ = stdin.write_all(&input);
            })
        });
        let drain = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });
        let status = wait_with_deadline(&mut child, self.deadline);
        if let Some(feeder) = feeder {
            let _ = feeder.join();
        }
        let stderr = drain
            .and_then(|drain| drain.join().ok())
            .unwrap_or_default();
        let status = status?;
        if !status.success() {
            return Err(TtsError::Engine(format!(
                "{} exited with {}: {}",
                self.program,
                status,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        if !output.exists() {
            return Err(TtsError::Engine(format!(
                "{} did not write {}",
                self.program,
                output.display()
            )));
        }
        Ok(output)
    }
}

fn wait_with_deadline(child: &mut Child, deadline: Duration) -> Result<ExitStatus, TtsError> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if started.elapsed() >= deadline {
            warn!(
                event = "tts_engine_killed",
                pid = child.id(),
                deadline_ms = deadline.as_millis() as u64
            );
            let _ = child.kill();
            let _ = child.wait();
            return Err(TtsError::Timeout(deadline));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn expand_placeholders(arg: &str, output: &Path, emotion: &str, text: &str) -> String {
    arg.replace("{output}", &output.to_string_lossy())
        .replace("{emotion}", emotion)
        .replace("{text}", text)
}

/// Deterministic artifact name for an utterance.
pub fn artifact_stem(text: &str, emotion: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [emotion, text] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();
    let mut output = String::with_capacity(24);
    for byte in digest.iter().take(12) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn build_synthesizer(
    config: &HubConfig,
) -> Result<Option<Arc<dyn SpeechSynthesizer>>, ConfigError> {
    match &config.tts {
        TtsSelection::None => Ok(None),
        TtsSelection::Command { program, args } => Ok(Some(Arc::new(CommandSynthesizer::new(
            program.clone(),
            args.clone(),
            config.output_dir.clone(),
            config.synthesis_timeout,
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct SlowSynth {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl SpeechSynthesizer for SlowSynth {
        fn name(&self) -> &str {
            "slow"
        }

        fn generate(&self, text: &str, emotion: &str) -> Result<PathBuf, TtsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(PathBuf::from(format!("/tmp/{emotion}-{text}.wav")))
        }
    }

    #[test]
    fn artifact_names_are_deterministic() {
        assert_eq!(artifact_stem("hello", "happy"), artifact_stem("hello", "happy"));
        assert_ne!(artifact_stem("hello", "happy"), artifact_stem("hello", "sad"));
        assert_eq!(artifact_stem("hello", "happy").len(), 24);
    }

    #[test]
    fn placeholders_expand_in_arguments() {
        let arg = expand_placeholders(
            "--out={output}:{emotion}",
            Path::new("/a/b.wav"),
            "happy",
            "hi",
        );
        assert_eq!(arg, "--out=/a/b.wav:happy");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bridge_passes_emotion_and_defaults_to_neutral() {
        let synth = Arc::new(SlowSynth {
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        });
        let bridge = TtsBridge::new(synth.clone(), 1, Duration::from_secs(2));
        let path = bridge.synthesize("hello", Some("happy")).await.expect("tts");
        assert_eq!(path, PathBuf::from("/tmp/happy-hello.wav"));
        let path = bridge.synthesize("hello", Some("  ")).await.expect("tts");
        assert_eq!(path, PathBuf::from("/tmp/neutral-hello.wav"));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bridge_times_out_slow_engine() {
        let synth = Arc::new(SlowSynth {
            delay: Duration::from_millis(500),
            calls: AtomicUsize::new(0),
        });
        let bridge = TtsBridge::new(synth, 1, Duration::from_millis(50));
        let err = bridge.synthesize("hello", None).await.expect_err("timeout");
        assert!(matches!(err, TtsError::Timeout(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_bridge_refuses_work() {
        let synth = Arc::new(SlowSynth {
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        });
        let bridge = TtsBridge::new(synth, 1, Duration::from_secs(1));
        bridge.close();
        let err = bridge.synthesize("hello", None).await.expect_err("closed");
        assert!(matches!(err, TtsError::PoolClosed));
    }

    #[cfg(unix)]
    #[test]
    fn command_synthesizer_writes_and_reuses_artifact() {
        let dir = tempdir().expect("tempdir");
        let synth = CommandSynthesizer::new(
            "sh".to_string(),
            vec!["-c".to_string(), "cat > \"$0\"".to_string(), "{output}".to_string()],
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        );
        let path = synth.generate("hello", "happy").expect("generate");
        assert_eq!(path, synth.artifact_path("hello", "happy"));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "hello");

        std::fs::write(&path, "cached").expect("overwrite");
        let again = synth.generate("hello", "happy").expect("reuse");
        assert_eq!(again, path);
        assert_eq!(std::fs::read_to_string(&again).expect("read"), "cached");
    }

    #[cfg(unix)]
    #[test]
    fn command_failure_is_reported() {
        let dir = tempdir().expect("tempdir");
        let synth = CommandSynthesizer::new(
            "sh".to_string(),
            vec!["-c".to_string(), "echo engine offline >&2; exit 3".to_string()],
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        );
        let err = synth.generate("hello", "happy").expect_err("failure");
        assert!(matches!(&err, TtsError::Engine(message) if message.contains("engine offline")));
    }

    #[cfg(unix)]
    #[test]
    fn chatty_engine_reading_stdin_late_completes() {
        let dir = tempdir().expect("tempdir");
        let synth = CommandSynthesizer::new(
            "sh".to_string(),
            vec![
                "-c".to_string(),
                "head -c 262144 /dev/zero >&2; cat > \"$0\"".to_string(),
                "{output}".to_string(),
            ],
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );
        let text = "a".repeat(256 * 1024);
        let path = synth.generate(&text, "neutral").expect("generate");
        assert_eq!(std::fs::metadata(&path).expect("artifact").len(), text.len() as u64);
    }

    #[cfg(unix)]
    #[test]
    fn hung_engine_is_killed_at_deadline() {
        let dir = tempdir().expect("tempdir");
        let synth = CommandSynthesizer::new(
            "sleep".to_string(),
            vec!["30".to_string()],
            dir.path().to_path_buf(),
            Duration::from_millis(200),
        );
        let started = Instant::now();
        let err = synth.generate("hello", "happy").expect_err("timeout");
        assert!(matches!(err, TtsError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
