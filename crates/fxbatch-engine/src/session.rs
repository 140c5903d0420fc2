use std::collections::BTreeMap;
use std::env;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fxbatch_contracts::cookies::AuthCookies;
use fxbatch_contracts::models::{ModelRegistry, ModelVariant};
use fxbatch_contracts::runs::GenerationRequest;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{HeaderMap, AUTHORIZATION, COOKIE, ORIGIN, REFERER, RETRY_AFTER, SET_COOKIE};
use serde_json::{json, Value};

use crate::error::TransportError;

pub const DEFAULT_SESSION_URL: &str = "https://labs.google/fx/api/auth/session";
pub const DEFAULT_GENERATE_URL: &str = "https://aisandbox-pa.googleapis.com/v1:runImageFx";
pub const SERVICE_ORIGIN: &str = "https://labs.google";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
const CLIENT_TOOL: &str = "IMAGE_FX";

const DEFAULT_TIMEOUT_SECS: f64 = 45.0;
const MIN_TIMEOUT_SECS: f64 = 5.0;
const MAX_TIMEOUT_SECS: f64 = 300.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub session_url: String,
    pub generate_url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_url: DEFAULT_SESSION_URL.to_string(),
            generate_url: DEFAULT_GENERATE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `FXBATCH_SESSION_URL`, `FXBATCH_GENERATE_URL`,
    /// `FXBATCH_USER_AGENT` and `FXBATCH_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            session_url: non_empty_env("FXBATCH_SESSION_URL").unwrap_or(defaults.session_url),
            generate_url: non_empty_env("FXBATCH_GENERATE_URL").unwrap_or(defaults.generate_url),
            user_agent: non_empty_env("FXBATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            timeout: Duration::from_secs_f64(env_f64(
                "FXBATCH_TIMEOUT_SECS",
                DEFAULT_TIMEOUT_SECS,
                MIN_TIMEOUT_SECS,
                MAX_TIMEOUT_SECS,
            )),
        }
    }

    pub fn with_endpoints(
        mut self,
        session_url: impl Into<String>,
        generate_url: impl Into<String>,
    ) -> Self {
        self.session_url = session_url.into();
        self.generate_url = generate_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Undecoded reply to a successful (2xx) generation call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    /// Cookies the service rotated through `Set-Cookie` on this exchange.
    pub refreshed_cookies: BTreeMap<String, String>,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            refreshed_cookies: BTreeMap::new(),
        }
    }
}

/// One round trip to the generation endpoint. Non-2xx replies come back as
/// [`TransportError`]s, never as a `RawResponse`.
pub trait GenerationTransport {
    fn generate(&self, request: &GenerationRequest) -> Result<RawResponse, TransportError>;

    /// Cookies rotated on exchanges that ended in an error, drained on read.
    /// Successful exchanges carry theirs on [`RawResponse`].
    fn take_refreshed_cookies(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

impl<T: GenerationTransport + ?Sized> GenerationTransport for &T {
    fn generate(&self, request: &GenerationRequest) -> Result<RawResponse, TransportError> {
        (**self).generate(request)
    }

    fn take_refreshed_cookies(&self) -> BTreeMap<String, String> {
        (**self).take_refreshed_cookies()
    }
}

impl<T: GenerationTransport + ?Sized> GenerationTransport for Box<T> {
    fn generate(&self, request: &GenerationRequest) -> Result<RawResponse, TransportError> {
        (**self).generate(request)
    }

    fn take_refreshed_cookies(&self) -> BTreeMap<String, String> {
        (**self).take_refreshed_cookies()
    }
}

impl<T: GenerationTransport + ?Sized> GenerationTransport for Arc<T> {
    fn generate(&self, request: &GenerationRequest) -> Result<RawResponse, TransportError> {
        (**self).generate(request)
    }

    fn take_refreshed_cookies(&self) -> BTreeMap<String, String> {
        (**self).take_refreshed_cookies()
    }
}

/// Authenticated HTTP session against the image service.
///
/// The bearer token is either handed in with [`SessionClient::with_access_token`]
/// or fetched lazily from the session endpoint with the cookie jar. Either way
/// it is cached until the service answers 401/403. Cookie values and tokens
/// are never logged.
pub struct SessionClient {
    cookies: Arc<AuthCookies>,
    config: SessionConfig,
    registry: ModelRegistry,
    http: HttpClient,
    client_session_id: String,
    access_token: Mutex<Option<String>>,
    stranded_cookies: Mutex<BTreeMap<String, String>>,
}

impl SessionClient {
    pub fn new(
        cookies: impl Into<Arc<AuthCookies>>,
        config: SessionConfig,
    ) -> Result<Self, TransportError> {
        let http = HttpClient::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            cookies: cookies.into(),
            config,
            registry: ModelRegistry::default(),
            http,
            client_session_id: client_session_id(),
            access_token: Mutex::new(None),
            stranded_cookies: Mutex::new(BTreeMap::new()),
        })
    }

    /// Seeds a bearer token so the first call skips the cookie exchange.
    /// Blank tokens are ignored.
    pub fn with_access_token(self, token: impl Into<String>) -> Self {
        let token = token.into().trim().to_string();
        if !token.is_empty() {
            self.store_token(Some(token));
        }
        self
    }

    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cookies(&self) -> &AuthCookies {
        &self.cookies
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    fn cached_token(&self) -> Option<String> {
        self.access_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_token(&self, token: Option<String>) {
        *self
            .access_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Exchanges the cookie jar for a bearer token.
    fn fetch_access_token(
        &self,
        refreshed: &mut BTreeMap<String, String>,
    ) -> Result<String, TransportError> {
        self.cookies
            .require_auth()
            .map_err(|err| TransportError::Unauthorized(err.to_string()))?;

        tracing::debug!(url = %self.config.session_url, "fetching session token");
        let response = self
            .http
            .get(&self.config.session_url)
            .header(COOKIE, self.cookies.cookie_header())
            .header(ORIGIN, SERVICE_ORIGIN)
            .header(REFERER, SERVICE_ORIGIN)
            .header("accept", "application/json")
            .timeout(self.config.timeout)
            .send()?;
        refreshed.extend(parse_set_cookies(response.headers()));
        let body = read_checked(response)?;

        let parsed: Value = serde_json::from_str(&body).map_err(|_| {
            TransportError::Unauthorized("session endpoint returned invalid JSON".to_string())
        })?;
        parsed
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::Unauthorized(
                    "session response carried no access token; cookies may be expired".to_string(),
                )
            })
    }

    fn exchange(
        &self,
        request: &GenerationRequest,
        refreshed: &mut BTreeMap<String, String>,
    ) -> Result<RawResponse, TransportError> {
        let variant = request.validate(&self.registry)?;
        let payload = build_payload(request, variant, &self.client_session_id);

        let token = match self.cached_token() {
            Some(token) => token,
            None => {
                let token = self.fetch_access_token(refreshed)?;
                self.store_token(Some(token.clone()));
                token
            }
        };

        tracing::debug!(
            model = %variant.wire_model,
            count = request.count,
            "submitting generation request"
        );
        let mut post = self
            .http
            .post(&self.config.generate_url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(ORIGIN, SERVICE_ORIGIN)
            .header(REFERER, SERVICE_ORIGIN)
            .timeout(self.config.timeout)
            .json(&payload);
        if !self.cookies.is_empty() {
            post = post.header(COOKIE, self.cookies.cookie_header());
        }
        let response = post.send()?;

        let status = response.status().as_u16();
        refreshed.extend(parse_set_cookies(response.headers()));
        match read_checked(response) {
            Ok(body) => Ok(RawResponse {
                status,
                body,
                refreshed_cookies: std::mem::take(refreshed),
            }),
            Err(err) => {
                if let TransportError::Unauthorized(_) = err {
                    self.store_token(None);
                }
                Err(err)
            }
        }
    }
}

impl GenerationTransport for SessionClient {
    fn generate(&self, request: &GenerationRequest) -> Result<RawResponse, TransportError> {
        let mut refreshed = BTreeMap::new();
        let outcome = self.exchange(request, &mut refreshed);
        if outcome.is_err() && !refreshed.is_empty() {
            self.stranded_cookies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(refreshed);
        }
        outcome
    }

    fn take_refreshed_cookies(&self) -> BTreeMap<String, String> {
        std::mem::take(
            &mut *self
                .stranded_cookies
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// JSON body for the generation endpoint.
pub fn build_payload(
    request: &GenerationRequest,
    variant: &ModelVariant,
    client_session_id: &str,
) -> Value {
    json!({
        "userInput": {
            "candidatesCount": request.count,
            "prompts": [request.prompt.trim()],
            "seed": request.seed.unwrap_or(0),
        },
        "aspectRatio": variant.wire_aspect_ratio(request.aspect_ratio).wire_name(),
        "modelInput": {
            "modelNameType": variant.wire_model,
        },
        "clientContext": {
            "sessionId": client_session_id,
            "tool": CLIENT_TOOL,
        },
    })
}

/// Maps an HTTP status onto the transport taxonomy. 2xx passes the body
/// through untouched.
pub fn classify_status(
    code: u16,
    body: String,
    retry_after: Option<Duration>,
) -> Result<String, TransportError> {
    match code {
        200..=299 => Ok(body),
        401 | 403 => Err(TransportError::Unauthorized(format!(
            "service answered {code}; cookies are expired or revoked"
        ))),
        429 => Err(TransportError::RateLimited {
            status: code,
            retry_after,
            body,
        }),
        500..=599 => Err(TransportError::ServerError { status: code, body }),
        _ => Err(TransportError::ClientError { status: code, body }),
    }
}

fn read_checked(response: HttpResponse) -> Result<String, TransportError> {
    let code = response.status().as_u16();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text()?;
    classify_status(code, body, retry_after)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Name/value pairs from every `Set-Cookie` header. Attributes are dropped
/// and cleared cookies (empty value) are skipped.
fn parse_set_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|raw| {
            let pair = raw.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() || value.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn client_session_id() -> String {
    format!(";{}", chrono::Utc::now().timestamp_millis())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn env_f64(key: &str, default: f64, min: f64, max: f64) -> f64 {
    non_empty_env(key)
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}
