//! Shelling out to git.
//!
//! One call to [`GitExecutor::git`] owns exactly one child process for
//! its duration. The executor builds the environment (caller env +
//! trampoline bundle + forced settings), spawns the process, captures
//! stdout/stderr in full plus a bounded diagnostic tail of the combined
//! output, and classifies the result. It never retries and never kills
//! a child on behalf of an abandoned caller; mutual exclusion on a
//! working directory is the domain layer's business.

use std::{
    borrow::Cow,
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Mutex,
        atomic::{AtomicIsize, Ordering},
    },
    time::Instant,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::OnceCell,
};

use crate::{
    errors::{self, GitErrorKind},
    tail::{TailBuffer, tail_str},
    trampoline::{Trampoline, TrampolineConfig, TrampolineSessions},
};

/// Default cap on captured output for text consumers. Callers that
/// stream large binary payloads (e.g. raw commit buffers) opt out with
/// `max_output_size: None`.
pub const MAX_TEXT_OUTPUT_BYTES: usize = 256 * 1024 * 1024;

// Combined stdout+stderr kept for diagnostics when a command fails.
const TAIL_CAP_BYTES: usize = 256 * 1024;
// How much of that tail ends up in the log line.
const LOGGED_TAIL_BYTES: usize = 1024;

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Exit codes which indicate success to the caller. Anything else
    /// is classified and raised (or returned, if expected).
    pub success_exit_codes: Vec<i32>,
    /// Classified error kinds the caller knows how to handle; these are
    /// returned in the result instead of raised.
    pub expected_errors: Vec<GitErrorKind>,
    /// Background tasks never trigger credential prompts and skip the
    /// passphrase-eviction heuristic on failure.
    pub is_background_task: bool,
    /// Cap on combined captured output; `None` means unbounded.
    pub max_output_size: Option<usize>,
    /// Extra environment variables for the child.
    pub env: HashMap<String, String>,
    /// Bytes to feed the child on stdin.
    pub stdin: Option<Vec<u8>>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            success_exit_codes: vec![0],
            expected_errors: Vec::new(),
            is_background_task: false,
            max_output_size: Some(MAX_TEXT_OUTPUT_BYTES),
            env: HashMap::new(),
            stdin: None,
        }
    }
}

/// The result of shelling out to git.
#[derive(Debug, Clone)]
pub struct GitResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// The classified error. `None` when the exit code was accepted or
    /// when nothing in the output matched a known failure.
    pub classified_error: Option<GitErrorKind>,
    /// Human-readable description of `classified_error`, when we have
    /// better copy than git's own message.
    pub error_description: Option<String>,
    /// The process working directory the command ran in (not the git
    /// working *tree*, which is a different concept).
    pub path: PathBuf,
}

impl GitResult {
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// A git command that exited with an unacceptable code.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GitCommandError {
    /// The full result, for callers that pattern-match on the
    /// classified kind to decide on recovery.
    pub result: GitResult,
    pub args: Vec<String>,
    pub message: String,
    /// Whether `message` is just the raw output of the command rather
    /// than one of our descriptions.
    pub is_raw_message: bool,
    #[source]
    pub source: Option<Box<GitError>>,
}

impl GitCommandError {
    pub(crate) fn new(result: GitResult, args: Vec<String>, terminal_output: String) -> Self {
        let (message, is_raw_message) = if let Some(description) = &result.error_description {
            (description.clone(), false)
        } else if !terminal_output.is_empty() {
            (terminal_output.clone(), true)
        } else if !result.stderr.is_empty() {
            (result.stderr_str().into_owned(), true)
        } else if !result.stdout.is_empty() {
            (result.stdout_str().into_owned(), true)
        } else {
            (
                format!("Unknown error (exit code {})", result.exit_code),
                false,
            )
        };

        Self {
            result,
            args,
            message,
            is_raw_message,
            source: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum GitError {
    /// The child process could not be created or driven at all (binary
    /// missing, invalid working directory, resource exhaustion).
    #[error("failed to execute {operation}: {source}")]
    Spawn {
        operation: String,
        #[source]
        source: std::io::Error,
    },
    /// Combined output exceeded the configured cap.
    #[error("maximum output size exceeded for {operation}")]
    OutputExceeded { operation: String },
    /// Unacceptable exit code with a classified or raw message.
    #[error(transparent)]
    Command(Box<GitCommandError>),
    /// A parser could not find an expected field. Indicates a git
    /// version/format mismatch and is always surfaced.
    #[error("malformed git output: {0}")]
    Malformed(String),
}

impl GitError {
    /// True when this is a command failure classified as `kind`.
    pub fn is_kind(&self, kind: GitErrorKind) -> bool {
        match self {
            GitError::Command(cmd) => cmd.result.classified_error == Some(kind),
            _ => false,
        }
    }
}

fn spawn_io_error(operation: &str, message: &str) -> GitError {
    GitError::Spawn {
        operation: operation.to_string(),
        source: std::io::Error::other(message.to_string()),
    }
}

/// Executes git commands under the trampoline environment.
pub struct GitExecutor {
    trampoline: Trampoline,
    git_path: OnceCell<PathBuf>,
}

impl GitExecutor {
    pub fn new(config: TrampolineConfig) -> Self {
        Self {
            trampoline: Trampoline::new(config),
            git_path: OnceCell::new(),
        }
    }

    /// The session registry shared with the credential IPC layer.
    pub fn sessions(&self) -> std::sync::Arc<TrampolineSessions> {
        self.trampoline.sessions()
    }

    async fn git_binary(&self) -> Result<&PathBuf, GitError> {
        self.git_path
            .get_or_try_init(|| async {
                utils::shell::resolve_executable_path("git")
                    .await
                    .ok_or_else(|| {
                        GitError::Spawn {
                            operation: "locating git".to_string(),
                            source: std::io::Error::new(
                                std::io::ErrorKind::NotFound,
                                "git executable not found on PATH",
                            ),
                        }
                    })
            })
            .await
    }

    /// Shell out to git with the given arguments, in the given process
    /// working directory. `name` identifies the calling operation in
    /// logs and error messages.
    ///
    /// Returns the result when the exit code is in
    /// `opts.success_exit_codes`, or when the classified error is in
    /// `opts.expected_errors`; raises [`GitError::Command`] otherwise.
    pub async fn git<I, S>(
        &self,
        args: I,
        path: &Path,
        name: &str,
        opts: ExecOptions,
    ) -> Result<GitResult, GitError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let git_binary = self.git_binary().await?.clone();

        self.trampoline
            .with_env(
                path,
                opts.is_background_task,
                &opts.env,
                &git_binary,
                |trampoline_env| {
                    run_command(&git_binary, &args, path, name, &opts, trampoline_env)
                },
            )
            .await
    }
}

async fn run_command(
    git_binary: &Path,
    args: &[String],
    path: &Path,
    name: &str,
    opts: &ExecOptions,
    trampoline_env: HashMap<String, String>,
) -> Result<GitResult, GitError> {
    let mut cmd = Command::new(git_binary);
    cmd.args(args).current_dir(path);
    cmd.envs(&opts.env);
    cmd.envs(&trampoline_env);
    // A smart terminal makes git (and its editors/pagers) interactive;
    // we are never interactive.
    cmd.env("TERM", "dumb");
    cmd.stdin(if opts.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    tracing::trace!(cwd = %path.display(), "{name}: git {}", args.join(" "));
    let started = Instant::now();

    let mut child = cmd.spawn().map_err(|e| GitError::Spawn {
        operation: name.to_string(),
        source: e,
    })?;

    let stdin_pipe = child.stdin.take();
    let Some(stdout_pipe) = child.stdout.take() else {
        return Err(spawn_io_error(name, "stdout pipe unavailable"));
    };
    let Some(stderr_pipe) = child.stderr.take() else {
        return Err(spawn_io_error(name, "stderr pipe unavailable"));
    };

    let tail = Mutex::new(TailBuffer::new(TAIL_CAP_BYTES));
    let remaining = opts
        .max_output_size
        .map(|cap| AtomicIsize::new(cap.min(isize::MAX as usize) as isize));

    let write_stdin = async {
        if let (Some(input), Some(mut pipe)) = (opts.stdin.as_ref(), stdin_pipe) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }
        Ok::<_, std::io::Error>(())
    };

    let (stdin_result, stdout_result, stderr_result) = tokio::join!(
        write_stdin,
        drain(stdout_pipe, &tail, remaining.as_ref()),
        drain(stderr_pipe, &tail, remaining.as_ref()),
    );

    let io_err = |e: std::io::Error| GitError::Spawn {
        operation: name.to_string(),
        source: e,
    };
    stdin_result.map_err(io_err)?;
    let (stdout, stdout_overflow) = stdout_result.map_err(io_err)?;
    let (stderr, stderr_overflow) = stderr_result.map_err(io_err)?;

    if stdout_overflow || stderr_overflow {
        // Nobody is reading anymore; don't leave the child wedged on a
        // full pipe.
        let _ = child.start_kill();
        let _ = child.wait().await;
        return Err(GitError::OutputExceeded {
            operation: name.to_string(),
        });
    }

    let status = child.wait().await.map_err(io_err)?;
    let exit_code = status.code().unwrap_or(-1);

    let acceptable_exit = opts.success_exit_codes.contains(&exit_code);
    let classified = if acceptable_exit {
        None
    } else {
        errors::classify(&String::from_utf8_lossy(&stderr), &String::from_utf8_lossy(&stdout))
    };
    let error_description =
        classified.and_then(|kind| errors::describe(kind, &String::from_utf8_lossy(&stderr)));

    let result = GitResult {
        exit_code,
        stdout,
        stderr,
        classified_error: classified,
        error_description,
        path: path.to_path_buf(),
    };

    tracing::trace!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        exit_code,
        "{name}: git {} finished",
        args.join(" ")
    );

    let acceptable_error = classified.is_some_and(|kind| opts.expected_errors.contains(&kind));
    if acceptable_error || acceptable_exit {
        return Ok(result);
    }

    let terminal_output = tail.lock().unwrap_or_else(|e| e.into_inner()).contents();

    let mut log_message = vec![format!(
        "`git {}` exited with an unexpected code: {exit_code}.",
        args.join(" ")
    )];
    if !terminal_output.is_empty() {
        // Leave even less of the combined output in the log.
        log_message.push(tail_str(&terminal_output, LOGGED_TAIL_BYTES).to_string());
    }
    if let Some(kind) = classified {
        log_message.push(format!(
            "(The error was parsed as {kind:?}: {})",
            result.error_description.as_deref().unwrap_or("-")
        ));
    }
    tracing::error!("{}", log_message.join("\n"));

    Err(GitError::Command(Box::new(GitCommandError::new(
        result,
        args.to_vec(),
        terminal_output,
    ))))
}

async fn drain(
    mut reader: impl AsyncRead + Unpin,
    tail: &Mutex<TailBuffer>,
    remaining: Option<&AtomicIsize>,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok((out, false));
        }
        tail.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(&buf[..n]);
        if let Some(remaining) = remaining
            && remaining.fetch_sub(n as isize, Ordering::Relaxed) - (n as isize) < 0
        {
            return Ok((out, true));
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Arguments to add to any git operation that can end up triggering a
/// rebase. The apply backend is the only one git still ships that we
/// don't support, so pin the merge backend regardless of user config.
pub fn rebase_arguments() -> Vec<String> {
    vec!["-c".to_string(), "rebase.backend=merge".to_string()]
}

/// The SHA reported by `git commit` porcelain output, e.g.
/// `[main 1234567] message`.
pub fn parse_commit_sha(result: &GitResult) -> Result<String, GitError> {
    result
        .stdout_str()
        .split(']')
        .next()
        .and_then(|head| head.split(' ').nth(1))
        .map(|sha| sha.to_string())
        .ok_or_else(|| GitError::Malformed("no commit SHA in commit output".to_string()))
}

/// True when `error` is git telling us a config file write failed
/// because its lock file already exists.
pub fn is_config_file_lock_error(error: &GitError) -> bool {
    error.is_kind(GitErrorKind::ConfigLockFileAlreadyExists)
}

/// Extract an absolute path to the offending configuration lock file
/// from a [`is_config_file_lock_error`] result.
pub fn parse_config_lock_file_path(result: &GitResult) -> Option<PathBuf> {
    use std::sync::LazyLock;
    static LOCK_FILE_PATH_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"(?m)^error: could not lock config file (.+?): File exists$")
            .unwrap_or_else(|e| panic!("lock file matcher: {e}"))
    });

    let stderr = result.stderr_str();
    let captured = LOCK_FILE_PATH_RE.captures(&stderr)?;

    // Git on Windows may print the path with forward slashes; those are
    // not legal in Windows file names, so a blanket replace is safe.
    let normalized = if cfg!(windows) {
        captured[1].replace('/', "\\")
    } else {
        captured[1].to_string()
    };

    Some(result.path.join(format!("{normalized}.lock")))
}
