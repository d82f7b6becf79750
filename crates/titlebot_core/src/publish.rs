use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use similar::TextDiff;

use crate::config::BotConfig;
use crate::lua_table::last_issue_in;

/// Decision made before touching the wiki.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditPlan {
    /// Published text already matches; nothing to do.
    NoChange,
    Update { summary: String, diff: String },
}

/// Compare the currently published text with the freshly rendered module and
/// derive the edit summary from the numeric delta between their highest keys.
pub fn plan_edit(old_text: &str, new_text: &str, note: Option<&str>) -> EditPlan {
    if old_text == new_text {
        return EditPlan::NoChange;
    }
    let summary = edit_summary(last_issue_in(old_text), last_issue_in(new_text), note);
    let diff = TextDiff::from_lines(old_text, new_text)
        .unified_diff()
        .context_radius(3)
        .header("published", "proposed")
        .to_string();
    EditPlan::Update { summary, diff }
}

fn edit_summary(old_last: Option<u32>, new_last: Option<u32>, note: Option<&str>) -> String {
    let base = match (old_last, new_last) {
        (Some(old), Some(new)) if new == old + 1 => format!("add comic title {new}"),
        (Some(old), Some(new)) if new > old => {
            format!("add comic titles from {} to {}", old + 1, new)
        }
        _ => "update comic titles".to_string(),
    };
    match note {
        Some(note) if !note.trim().is_empty() => format!("{base} ({})", note.trim()),
        _ => base,
    }
}

/// Permanent rejection reasons; retrying the same edit immediately will not
/// help, the cycle is logged as failed instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditRejection {
    Conflict,
    Locked,
    SpamFilter,
    NotSaved,
}

impl EditRejection {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Conflict => "edit conflict",
            Self::Locked => "page is locked",
            Self::SpamFilter => "rejected by spam filter",
            Self::NotSaved => "page was not saved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Saved,
    Rejected {
        reason: EditRejection,
        detail: String,
    },
}

/// The slice of a wiki session this bot needs. Network-free implementations
/// back the runner tests.
pub trait WikiPageApi {
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn fetch_page_text(&mut self, title: &str) -> Result<Option<String>>;
    fn submit_edit(&mut self, title: &str, text: &str, summary: &str) -> Result<EditOutcome>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let api_url = match config.api_url() {
            Some(value) => value,
            None => {
                bail!("wiki api_url is not configured (set [wiki] api_url or TITLEBOT_API_URL)")
            }
        };
        Ok(Self {
            api_url,
            user_agent: config.user_agent(),
            timeout_ms: config.http_timeout_ms(),
            max_retries: 2,
            max_write_retries: 3,
            retry_delay_ms: 500,
        })
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
        })
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid wiki api_url: {}", self.config.api_url))?;
        let pairs = with_format_params(params);

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some((code, info)) = api_error(&payload) {
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    /// POST without interpreting an `error` payload; the caller classifies.
    fn request_json_post_raw(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let pairs = with_format_params(params);

        for attempt in 0..=self.config.max_write_retries {
            self.apply_rate_limit();
            let response = self
                .client
                .post(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .form(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_write_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    return response
                        .json()
                        .context("failed to decode MediaWiki API JSON response");
                }
                Err(error) => {
                    if attempt < self.config.max_write_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn request_json_post(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let payload = self.request_json_post_raw(params)?;
        if let Some((code, info)) = api_error(&payload) {
            bail!("MediaWiki API error [{code}]: {info}");
        }
        Ok(payload)
    }

    fn apply_rate_limit(&mut self) {
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            let min_delay = Duration::from_millis(300);
            if elapsed < min_delay {
                sleep(min_delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        sleep(Duration::from_millis(
            self.config
                .retry_delay_ms
                .saturating_mul(2u64.saturating_pow(exponent)),
        ));
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.csrftoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }
}

impl WikiPageApi for MediaWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.logintoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json_post(&[
            ("action", "login".to_string()),
            ("lgname", username.to_string()),
            ("lgpassword", password.to_string()),
            ("lgtoken", login_token),
        ])?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn fetch_page_text(&mut self, title: &str) -> Result<Option<String>> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content".to_string()),
            ("rvslots", "main".to_string()),
        ])?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode page content API response")?;

        let Some(page) = parsed.query.pages.first() else {
            return Ok(None);
        };
        if page.missing.unwrap_or(false) {
            return Ok(None);
        }
        let content = page
            .revisions
            .first()
            .and_then(|revision| revision.slots.as_ref())
            .and_then(|slots| slots.main.as_ref())
            .map(|slot| slot.content.clone());
        Ok(content)
    }

    fn submit_edit(&mut self, title: &str, text: &str, summary: &str) -> Result<EditOutcome> {
        let token = self.ensure_csrf_token()?;
        let payload = self.request_json_post_raw(&[
            ("action", "edit".to_string()),
            ("title", title.to_string()),
            ("text", text.to_string()),
            ("summary", summary.to_string()),
            ("bot", "1".to_string()),
            ("token", token),
        ])?;

        if let Some((code, info)) = api_error(&payload) {
            if let Some(reason) = classify_rejection(&code) {
                return Ok(EditOutcome::Rejected {
                    reason,
                    detail: format!("[{code}] {info}"),
                });
            }
            bail!("MediaWiki API error [{code}]: {info}");
        }

        let edit_payload: EditResponse =
            serde_json::from_value(payload).context("failed to decode edit response")?;
        match edit_payload.edit.and_then(|edit| edit.result) {
            Some(result) if result == "Success" => Ok(EditOutcome::Saved),
            Some(result) => Ok(EditOutcome::Rejected {
                reason: EditRejection::NotSaved,
                detail: result,
            }),
            None => Ok(EditOutcome::Rejected {
                reason: EditRejection::NotSaved,
                detail: "missing edit payload in API response".to_string(),
            }),
        }
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn classify_rejection(code: &str) -> Option<EditRejection> {
    match code {
        "editconflict" => Some(EditRejection::Conflict),
        "protectedpage" | "protectedtitle" | "cascadeprotected" => Some(EditRejection::Locked),
        "spamblacklist" | "abusefilter-disallowed" | "spamdetected" => {
            Some(EditRejection::SpamFilter)
        }
        "pagedeleted" | "articleexists" => Some(EditRejection::NotSaved),
        _ => None,
    }
}

fn api_error(payload: &Value) -> Option<(String, String)> {
    let error = payload.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error")
        .to_string();
    let info = error
        .get("info")
        .and_then(Value::as_str)
        .unwrap_or("unknown info")
        .to_string();
    Some((code, info))
}

fn with_format_params(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    #[allow(dead_code)]
    title: String,
    missing: Option<bool>,
    #[serde(default)]
    revisions: Vec<RevisionItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionItem {
    slots: Option<SlotsPayload>,
}

#[derive(Debug, Deserialize)]
struct SlotsPayload {
    main: Option<SlotPayload>,
}

#[derive(Debug, Deserialize)]
struct SlotPayload {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
}
