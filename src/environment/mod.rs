//! Resolves where a build clones from, with which credential, and which
//! addresses the build containers use to reach the server.

pub mod url;

use std::fmt;
use std::sync::Arc;

use ::url::Url;
use serde::Serialize;

use crate::auth::{AuthError, TokenIssuer, TokenScope};
use crate::store::{RecordStore, Repo, StoreError};

pub use self::url::{container_url, is_loopback, join_path, parse_clone_url, repo_link};

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("refusing clone URL for {0} with an embedded password")]
    InsecureUrl(String),

    #[error("credential for {credential_host} cannot be used with {url_host}")]
    CredentialHostMismatch {
        credential_host: String,
        url_host: String,
    },

    #[error("fetching upstream credential for {host}: {source}")]
    UpstreamCredential {
        host: String,
        #[source]
        source: StoreError,
    },

    #[error("server URL {0} has no host")]
    MissingHost(String),

    #[error(transparent)]
    Token(#[from] AuthError),
}

/// A netrc-style credential bound to exactly one machine.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct NetrcEntry {
    pub machine: String,
    pub login: String,
    pub password: String,
}

impl fmt::Debug for NetrcEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetrcEntry")
            .field("machine", &self.machine)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything the executor needs to fetch the source and call back home.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Container-visible clone URL.
    pub clone_url: Url,
    pub credential: Option<NetrcEntry>,
    /// Container-visible server URL.
    pub callback_url: Url,
    /// Workspace path derived from the untranslated clone URL.
    pub link: String,
}

/// Login attached to server-issued access tokens.
pub const ACCESS_TOKEN_LOGIN: &str = "x-access-token";

pub struct Resolver {
    store: Arc<dyn RecordStore>,
    tokens: Arc<dyn TokenIssuer>,
    app_url: Url,
    container_host: String,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn RecordStore>,
        tokens: Arc<dyn TokenIssuer>,
        app_url: Url,
        container_host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tokens,
            app_url,
            container_host: container_host.into(),
        }
    }

    pub fn app_url(&self) -> &Url {
        &self.app_url
    }

    /// Container-visible form of `url`.
    pub fn translate(&self, url: &Url) -> Result<Url, EnvError> {
        container_url(url, &self.container_host)
    }

    /// Resolves the clone source and credential for `repo`.
    ///
    /// # Errors
    ///
    /// Fails on unparseable or insecure URLs, a failed upstream credential
    /// fetch, or a token that cannot be minted. All are fatal for the build.
    pub async fn resolve(&self, repo: &Repo) -> Result<Environment, EnvError> {
        let (clone_url, credential) = match repo.origin.as_deref() {
            Some(origin) if repo.mirror => {
                let url = parse_clone_url(origin)?;
                let host = host_of(&url)?;
                let upstream = self
                    .store
                    .fetch_upstream_credential(&host)
                    .await
                    .map_err(|source| EnvError::UpstreamCredential {
                        host: host.clone(),
                        source,
                    })?;
                let entry = NetrcEntry {
                    machine: host,
                    login: upstream.login,
                    password: upstream.token,
                };
                (url, Some(entry))
            }
            None if !repo.mirror => {
                let url = self.server_clone_url(&repo.uri)?;
                let token = self
                    .tokens
                    .issue(&TokenScope::RepoRead(repo.uri.clone()))
                    .await?;
                let entry = NetrcEntry {
                    machine: host_of(&self.app_url)?,
                    login: ACCESS_TOKEN_LOGIN.to_string(),
                    password: token.token,
                };
                (url, Some(entry))
            }
            _ => (self.server_clone_url(&repo.uri)?, None),
        };

        let clone_host = host_of(&clone_url)?;
        if let Some(entry) = &credential {
            if !entry.machine.eq_ignore_ascii_case(&clone_host) {
                return Err(EnvError::CredentialHostMismatch {
                    credential_host: entry.machine.clone(),
                    url_host: clone_host,
                });
            }
        }

        let link = repo_link(&clone_url);
        let translated = self.translate(&clone_url)?;
        // The credential follows the URL to its container-visible host.
        let credential = match credential {
            Some(mut entry) => {
                entry.machine = host_of(&translated)?;
                Some(entry)
            }
            None => None,
        };
        let callback_url = self.translate(&self.app_url)?;

        tracing::debug!(
            repo = %repo.uri,
            clone_url = %translated,
            authenticated = credential.is_some(),
            "Resolved build environment"
        );
        Ok(Environment {
            clone_url: translated,
            credential,
            callback_url,
            link,
        })
    }

    fn server_clone_url(&self, uri: &str) -> Result<Url, EnvError> {
        let url = join_path(&self.app_url, uri)?;
        if url.password().is_some() {
            return Err(EnvError::InsecureUrl(host_of(&url)?));
        }
        Ok(url)
    }
}

fn host_of(url: &Url) -> Result<String, EnvError> {
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(host.to_string()),
        _ => Err(EnvError::MissingHost(url.to_string())),
    }
}

/// Container host used when none is configured.
pub fn default_container_host() -> &'static str {
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        "host.docker.internal"
    } else {
        "172.17.0.1"
    }
}
