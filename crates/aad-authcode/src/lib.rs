//! Authorization code acquisition through an external helper process.
//!
//! The helper is a small GUI program: it is started with a window title and an
//! authorization URL, lets the user sign in, and prints the authorization code found in
//! the redirect URL as a single line on its standard output. It exits with status 0 iff
//! a code was found.
//!
//! An empty code is always a failure, whatever the exit status.

#[macro_use]
extern crate tracing;

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};

use url::Url;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum AuthCodeError {
    #[error("failed to start helper `{}`", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read helper output")]
    Io(#[from] io::Error),
    #[error("helper failed ({status})")]
    HelperFailed { status: ExitStatus },
    #[error("no authorization code")]
    NoCode,
    #[error("token exchange failed")]
    Exchange(#[source] BoxError),
}

/// Parameters of an OAuth 2.0 authorization code request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub endpoint: Url,
    pub client_id: String,
    pub scope: String,
    pub redirect_uri: String,
}

impl AuthorizationRequest {
    /// URL the user is sent to, carrying the request as query parameters.
    pub fn authorization_url(&self) -> Url {
        let mut url = self.endpoint.clone();

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scope)
            .append_pair("redirect_uri", &self.redirect_uri);

        url
    }
}

/// Something able to obtain an authorization code for a URL
pub trait AuthCodeProvider {
    fn authorization_code(&self, title: &str, url: &Url) -> Result<String, AuthCodeError>;
}

/// Runs `<program> [args…] <title> <url>` and reads the code from its standard output.
#[derive(Debug, Clone)]
pub struct HelperProcess {
    program: PathBuf,
    args: Vec<OsString>,
}

impl HelperProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Adds an argument passed before the title and the URL.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl AuthCodeProvider for HelperProcess {
    fn authorization_code(&self, title: &str, url: &Url) -> Result<String, AuthCodeError> {
        debug!(program = %self.program.display(), %title, "Starting authorization code helper");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(title)
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|source| AuthCodeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            warn!(status = %output.status, "Authorization code helper failed");
            return Err(AuthCodeError::HelperFailed { status: output.status });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let code = stdout.lines().next().map(str::trim).unwrap_or_default();

        if code.is_empty() {
            return Err(AuthCodeError::NoCode);
        }

        Ok(code.to_owned())
    }
}

/// Value of the first `code` query pair, as inspected by the helper on redirect.
pub fn extract_code(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty())
}

/// Exchanges an authorization code for a token
pub trait TokenExchange {
    type Token;

    fn exchange(&self, request: &AuthorizationRequest, code: &str) -> Result<Self::Token, AuthCodeError>;
}

/// Obtains a code from `provider` and exchanges it.
///
/// The exchange is never attempted without a code.
pub fn acquire_token<P, E>(
    provider: &P,
    exchange: &E,
    request: &AuthorizationRequest,
    title: &str,
) -> Result<E::Token, AuthCodeError>
where
    P: AuthCodeProvider + ?Sized,
    E: TokenExchange + ?Sized,
{
    let url = request.authorization_url();

    let code = provider.authorization_code(title, &url)?;
    let code = code.trim();

    if code.is_empty() {
        info!("Authorization code helper returned no code");
        return Err(AuthCodeError::NoCode);
    }

    info!("Authorization code received");

    exchange.exchange(request, code)
}
