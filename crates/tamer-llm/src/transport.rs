use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, RETRY_AFTER};
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::io::BufReader;
use std::thread;
use std::time::{Duration, Instant};
use tamer_core::{
    ChatRequest, ChatTransport, GenerationConfig, InterruptFlag, OpenStream, ProviderConfig,
    RateLimitSnapshot,
};
use tamer_errors::{ApiError, ApiErrorKind, Interrupted};
use tracing::{debug, warn};

use crate::sse::SseFrames;

/// Base delay for network/transport error retries (1s, 2s, 4s exponential backoff).
const NETWORK_RETRY_BASE_MS: u64 = 1000;
/// Granularity at which retry backoff notices the interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

/// Blocking HTTP transport for OpenAI-compatible streaming endpoints.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    provider: ProviderConfig,
    client: Client,
    max_retries: u8,
    retry_base_ms: u64,
    debug: bool,
    interrupt: InterruptFlag,
}

impl HttpTransport {
    pub fn new(provider: ProviderConfig, generation: &GenerationConfig, debug: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(generation.timeout_seconds))
            .build()?;
        Ok(Self {
            provider,
            client,
            max_retries: generation.max_retries,
            retry_base_ms: generation.retry_base_ms,
            debug,
            interrupt: InterruptFlag::new(),
        })
    }

    /// Abandon connection attempts and retry backoff once `interrupt` is set.
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    fn backoff(&self, delay: Duration) -> Result<()> {
        let deadline = Instant::now() + delay;
        loop {
            if self.interrupt.is_set() {
                return Err(Interrupted.into());
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            thread::sleep(left.min(INTERRUPT_POLL));
        }
    }
}

impl ChatTransport for HttpTransport {
    fn open_stream(&self, request: &ChatRequest) -> Result<OpenStream> {
        let api_key = self.provider.resolve_api_key();
        if self.provider.requires_api_key && api_key.is_none() {
            return Err(ApiError::missing_api_key(&self.provider.api_key_env).into());
        }

        let payload = build_payload(request);
        if self.debug {
            debug!(endpoint = %self.provider.endpoint, payload = %payload, "chat request");
        } else {
            debug!(
                endpoint = %self.provider.endpoint,
                model = %request.model,
                messages = request.messages.len(),
                "chat request"
            );
        }

        let mut last_err: Option<ApiError> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.max_retries {
            if self.interrupt.is_set() {
                debug!(attempt, "chat request abandoned");
                return Err(Interrupted.into());
            }
            let mut builder = self
                .client
                .post(&self.provider.endpoint)
                .header(ACCEPT, "text/event-stream")
                .json(&payload);
            if let Some(key) = api_key.as_deref() {
                builder = builder.bearer_auth(key);
            }
            for (name, value) in &self.provider.extra_headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            match builder.send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let rate_limits = rate_limits_from_headers(resp.headers());
                        let frames = SseFrames::new(BufReader::new(resp));
                        return Ok(OpenStream {
                            rate_limits,
                            frames: Box::new(frames),
                        });
                    }

                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text().unwrap_or_default();
                    let err = ApiError::from_response(status.as_u16(), &body);
                    if should_retry_status(status) && attempt < self.max_retries {
                        warn!(status = status.as_u16(), attempt, "retrying chat request");
                        self.backoff(retry_delay_ms(self.retry_base_ms, attempt, retry_after))?;
                        last_err = Some(err);
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    return Err(err.into());
                }
                Err(e) => {
                    let err = transport_error(&e);
                    if should_retry_transport_error(&e) && attempt < self.max_retries {
                        warn!(error = %err, attempt, "retrying chat request after transport error");
                        self.backoff(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None))?;
                        last_err = Some(err);
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
        Err(last_err
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow!("chat stream request failed")))
    }
}

/// JSON body for a streaming chat completion. Optional sampling parameters
/// are included only when they differ from the provider defaults.
pub fn build_payload(request: &ChatRequest) -> Value {
    let generation = &request.generation;
    let mut payload = json!({
        "model": request.model,
        "messages": request.messages,
        "temperature": generation.temperature,
        "stream": true,
        "stream_options": {"include_usage": true},
    });
    if let Some(max_tokens) = generation.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if (generation.top_p - 1.0).abs() > f64::EPSILON {
        payload["top_p"] = json!(generation.top_p);
    }
    if generation.frequency_penalty != 0.0 {
        payload["frequency_penalty"] = json!(generation.frequency_penalty);
    }
    if generation.presence_penalty != 0.0 {
        payload["presence_penalty"] = json!(generation.presence_penalty);
    }
    if let Some(stop) = generation.stop.as_ref().filter(|stop| !stop.is_empty()) {
        payload["stop"] = json!(stop);
    }
    if let Some(seed) = generation.seed {
        payload["seed"] = json!(seed);
    }
    payload
}

/// Read rate limit counters from the standard headers or a known provider
/// variant. Missing or unparsable headers leave the field empty.
pub fn rate_limits_from_headers(headers: &HeaderMap) -> RateLimitSnapshot {
    let read = |names: &[&str]| {
        names.iter().find_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
        })
    };
    RateLimitSnapshot {
        limit_requests: read(&[
            "x-ratelimit-limit-requests",
            "x-ratelimit-limit",
            "anthropic-ratelimit-requests-limit",
        ]),
        limit_tokens: read(&[
            "x-ratelimit-limit-tokens",
            "anthropic-ratelimit-tokens-limit",
        ]),
        remaining_requests: read(&[
            "x-ratelimit-remaining-requests",
            "x-ratelimit-remaining",
            "anthropic-ratelimit-requests-remaining",
        ]),
        remaining_tokens: read(&[
            "x-ratelimit-remaining-tokens",
            "anthropic-ratelimit-tokens-remaining",
        ]),
    }
}

fn transport_error(err: &reqwest::Error) -> ApiError {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host")
        || inner_msg.contains("getaddrinfo");

    if err.is_timeout() {
        ApiError::connection("the request timed out")
    } else if is_dns {
        ApiError::connection("could not resolve the provider hostname")
    } else if err.is_connect() {
        ApiError::connection("the connection was refused")
    } else {
        ApiError::new(ApiErrorKind::Unknown, format!("network error: {err}"))
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponent = u32::from(attempt);
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}
