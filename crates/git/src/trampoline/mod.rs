//! The credential trampoline: the environment bundle that redirects
//! git's credential-helper and askpass protocols to the running
//! application, plus the per-invocation session bookkeeping behind it.

mod sessions;

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use regex::Regex;
use tokio::sync::OnceCell;

pub use sessions::{SessionMetadata, SessionToken, TrampolineSessions};
use sessions::RetireGuard;

use crate::{
    errors::{self, GitErrorKind},
    exec::{GitCommandError, GitError},
};

/// Configuration for the trampoline environment, owned by whoever runs
/// the credential IPC server.
#[derive(Debug, Clone)]
pub struct TrampolineConfig {
    /// Port the in-process IPC server listens on; handed to child
    /// processes so the askpass/credential-helper binaries can call back.
    pub port: u16,
    /// Path of the askpass binary, if any. `None` sets `GIT_ASKPASS` to
    /// the empty string, which silences git's own terminal prompting and
    /// leaves the credential helper in charge.
    pub askpass_path: Option<PathBuf>,
    /// Version string of the host application, folded into the
    /// `GIT_USER_AGENT` sent to remotes.
    pub client_version: String,
    /// SSH agent environment (e.g. `SSH_AUTH_SOCK`), opaque to this
    /// layer; merged into every invocation's environment.
    pub ssh_env: HashMap<String, String>,
}

impl Default for TrampolineConfig {
    fn default() -> Self {
        Self {
            port: 0,
            askpass_path: None,
            client_version: format!("GitCore/{}", env!("CARGO_PKG_VERSION")),
            ssh_env: HashMap::new(),
        }
    }
}

// Git emits this when the credential helper declined to provide
// credentials and terminal prompting is off. See `with_env` for why we
// translate it.
static PROMPTS_DISABLED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^fatal: could not read .*: terminal prompts disabled\n$")
        .unwrap_or_else(|e| panic!("prompts-disabled matcher: {e}"))
});

static GIT_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"git version (.*)").unwrap_or_else(|e| panic!("git version matcher: {e}"))
});

pub(crate) struct Trampoline {
    config: TrampolineConfig,
    sessions: Arc<TrampolineSessions>,
    user_agent: OnceCell<String>,
}

impl Trampoline {
    pub(crate) fn new(config: TrampolineConfig) -> Self {
        Self {
            config,
            sessions: TrampolineSessions::new(),
            user_agent: OnceCell::new(),
        }
    }

    pub(crate) fn sessions(&self) -> Arc<TrampolineSessions> {
        Arc::clone(&self.sessions)
    }

    /// Run `body` with the trampoline environment for one invocation.
    ///
    /// A fresh token is minted and registered, the environment bundle is
    /// assembled (credential helper config travels via
    /// `GIT_CONFIG_PARAMETERS` rather than argv so that commands spawned
    /// by filters, e.g. Git LFS, inherit it), and the token is retired
    /// on every exit path.
    ///
    /// Two pieces of failure bookkeeping happen here:
    /// - a non-background SSH authentication failure evicts the most
    ///   recently served passphrase for this token, forcing a re-prompt
    ///   on the next attempt;
    /// - a "terminal prompts disabled" failure after this token recorded
    ///   a rejected credential is re-raised as a regular authentication
    ///   failure, so the credential-helper protocol surfaces the same
    ///   message the legacy inline-auth flow did.
    pub(crate) async fn with_env<T, F, Fut>(
        &self,
        path: &Path,
        is_background_task: bool,
        caller_env: &HashMap<String, String>,
        git_binary: &Path,
        body: F,
    ) -> Result<T, GitError>
    where
        F: FnOnce(HashMap<String, String>) -> Fut,
        Fut: Future<Output = Result<T, GitError>>,
    {
        let token = SessionToken::mint();
        self.sessions.register_session(
            token.clone(),
            SessionMetadata {
                working_directory: path.to_path_buf(),
                is_background_task,
            },
        );
        let _retire = RetireGuard::new(self.sessions(), token.clone());

        let env = self.environment(&token, caller_env, git_binary).await;

        match body(env).await {
            Ok(value) => Ok(value),
            Err(e) => {
                // We can't know which credential attempt the remote
                // rejected; assuming it was the last one served is the
                // best the askpass flow allows.
                if !is_background_task && is_ssh_auth_failure(&e) {
                    self.sessions.forget_most_recent_passphrase(&token);
                }

                if self.sessions.has_rejected_credentials(&token)
                    && let GitError::Command(cmd) = &e
                    && PROMPTS_DISABLED_RE.is_match(&cmd.message)
                {
                    let description = errors::auth_failure_description();
                    let mut result = cmd.result.clone();
                    result.classified_error = Some(GitErrorKind::HttpsAuthenticationFailed);
                    result.error_description = Some(description.clone());
                    let args = cmd.args.clone();
                    return Err(GitError::Command(Box::new(GitCommandError {
                        result,
                        args,
                        message: description,
                        is_raw_message: false,
                        source: Some(Box::new(e)),
                    })));
                }

                Err(e)
            }
        }
    }

    async fn environment(
        &self,
        token: &SessionToken,
        caller_env: &HashMap<String, String>,
        git_binary: &Path,
    ) -> HashMap<String, String> {
        let existing_config = caller_env
            .get("GIT_CONFIG_PARAMETERS")
            .cloned()
            .or_else(|| std::env::var("GIT_CONFIG_PARAMETERS").ok())
            .unwrap_or_default();
        let config_prefix = if existing_config.is_empty() {
            String::new()
        } else {
            format!("{existing_config} ")
        };

        let askpass = self
            .config
            .askpass_path
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut env = HashMap::new();
        env.insert("DESKTOP_PORT".to_string(), self.config.port.to_string());
        env.insert("DESKTOP_TRAMPOLINE_TOKEN".to_string(), token.to_string());
        env.insert("GIT_ASKPASS".to_string(), askpass);
        // The first, empty helper entry clears any helpers configured in
        // gitconfig so ours is the only one consulted.
        env.insert(
            "GIT_CONFIG_PARAMETERS".to_string(),
            format!("{config_prefix}'credential.helper=' 'credential.helper=desktop'"),
        );
        env.insert(
            "GIT_USER_AGENT".to_string(),
            self.user_agent(git_binary).await,
        );
        env.extend(self.config.ssh_env.clone());
        env
    }

    /// `git/<version> (<client>; <os> <arch>)`, probed from the binary
    /// once per process. Recomputation would be harmless, just wasteful.
    pub(crate) async fn user_agent(&self, git_binary: &Path) -> String {
        self.user_agent
            .get_or_init(|| async {
                let version = match tokio::process::Command::new(git_binary)
                    .arg("--version")
                    .output()
                    .await
                {
                    Ok(out) => {
                        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
                        GIT_VERSION_RE
                            .captures(&stdout)
                            .map(|c| c[1].trim().to_string())
                    }
                    Err(e) => {
                        tracing::warn!("could not get git version information: {e}");
                        None
                    }
                };
                format!(
                    "git/{} ({}; {} {})",
                    version.unwrap_or_else(|| "unknown".to_string()),
                    self.config.client_version,
                    std::env::consts::OS,
                    std::env::consts::ARCH,
                )
            })
            .await
            .clone()
    }
}

fn is_ssh_auth_failure(e: &GitError) -> bool {
    match e {
        GitError::Command(cmd) => matches!(
            cmd.result.classified_error,
            Some(GitErrorKind::SshAuthenticationFailed) | Some(GitErrorKind::SshPermissionDenied)
        ),
        _ => false,
    }
}
