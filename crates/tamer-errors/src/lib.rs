//! Error classification and user guidance for the tamer CLI.
//!
//! Provider failures are reduced to a closed [`ApiErrorKind`] before they
//! reach the terminal, and [`ErrorHandler`] turns any error into a message
//! with recovery suggestions.

use anyhow::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Category of a failed chat-completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiErrorKind {
    RateLimited,
    BadRequest,
    AuthFailed,
    ConnectionFailed,
    PermissionDenied,
    NotFound,
    Unknown,
}

impl ApiErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            400 => Self::BadRequest,
            401 => Self::AuthFailed,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            _ => Self::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate limited",
            Self::BadRequest => "bad request",
            Self::AuthFailed => "authentication failed",
            Self::ConnectionFailed => "connection failed",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::Unknown => "API error",
        }
    }
}

/// A classified provider or transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub status: Option<u16>,
    pub detail: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {status}): {}", self.kind.label(), self.detail),
            None => write!(f, "{}: {}", self.kind.label(), self.detail),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn new(kind: ApiErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            detail: detail.into(),
        }
    }

    /// Classify a non-success HTTP response. The detail is taken from
    /// `error.message` in a JSON body, else from the first 200 characters.
    pub fn from_response(status: u16, body: &str) -> Self {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(error_message))
            .unwrap_or_else(|| body.trim().chars().take(200).collect());
        Self {
            kind: ApiErrorKind::from_status(status),
            status: Some(status),
            detail,
        }
    }

    /// Classify an `{"error": ...}` object delivered inside a stream.
    pub fn from_stream_error(error: &Value) -> Self {
        let status = error
            .get("code")
            .and_then(|code| {
                code.as_u64()
                    .or_else(|| code.as_str().and_then(|s| s.parse::<u64>().ok()))
            })
            .and_then(|code| u16::try_from(code).ok());
        let detail = error_message(error).unwrap_or_else(|| error.to_string());
        Self {
            kind: status.map_or(ApiErrorKind::Unknown, ApiErrorKind::from_status),
            status,
            detail,
        }
    }

    pub fn connection(detail: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::ConnectionFailed, detail)
    }

    pub fn missing_api_key(env_var: &str) -> Self {
        let detail = if env_var.trim().is_empty() {
            "no API key configured for this provider".to_string()
        } else {
            format!("no API key configured; set {env_var} or add api_key to the provider settings")
        };
        Self::new(ApiErrorKind::AuthFailed, detail)
    }
}

fn error_message(error: &Value) -> Option<String> {
    error
        .get("message")
        .or(Some(error))
        .and_then(|m| m.as_str().map(ToString::to_string))
}

/// Raised when the user cancels a stream or command with Ctrl+C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interrupted by user")]
pub struct Interrupted;

pub fn is_interrupted(error: &Error) -> bool {
    error.downcast_ref::<Interrupted>().is_some()
}

/// Enhanced error with user-friendly message and recovery suggestions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedError {
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub error_type: ErrorType,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorType {
    /// Missing key, unknown provider, bad settings file
    Configuration,
    /// DNS, refused connection, timeout
    Network,
    /// Rejected credentials or region restrictions
    Permission,
    /// Provider quota or rate limit
    Quota,
    /// Invalid request parameters or unknown resources
    Validation,
    Runtime,
    Unknown,
}

impl EnhancedError {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        error_type: ErrorType,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            suggestions: Vec::new(),
            error_type,
            context: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions.extend(suggestions);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn into_error(self) -> Error {
        Error::new(self)
    }

    /// Format error for display
    pub fn format(&self, verbose: bool) -> String {
        let mut output = String::new();

        output.push_str(&format!("{} {}\n", self.error_type.emoji(), self.title));
        output.push_str(&format!("  {}\n", self.message));

        if verbose && let Some(context) = &self.context {
            output.push_str(&format!("\n  Context: {}\n", context));
        }

        if !self.suggestions.is_empty() {
            output.push_str("\n  Suggestions:\n");
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                output.push_str(&format!("    {}. {}\n", i + 1, suggestion));
            }
        }

        output
    }
}

impl ErrorType {
    pub fn emoji(&self) -> &'static str {
        match self {
            ErrorType::Configuration => "🔧",
            ErrorType::Network => "🌐",
            ErrorType::Permission => "🔒",
            ErrorType::Quota => "⏳",
            ErrorType::Validation => "📋",
            ErrorType::Runtime => "⚡",
            ErrorType::Unknown => "❓",
        }
    }
}

impl fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

impl std::error::Error for EnhancedError {}

/// Turns errors into terminal-ready text.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandler {
    verbose: bool,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn handle(&self, error: &Error) -> String {
        self.enhance(error).format(self.verbose)
    }

    pub fn enhance(&self, error: &Error) -> EnhancedError {
        if let Some(enhanced) = error.downcast_ref::<EnhancedError>() {
            return enhanced.clone();
        }
        if let Some(api) = error.downcast_ref::<ApiError>() {
            return api_guidance(api).with_context(format!("{error:#}"));
        }
        self.classify_error(&error.to_string())
            .with_context(format!("{error:#}"))
    }

    /// Classify error based on message patterns
    fn classify_error(&self, error_message: &str) -> EnhancedError {
        let lower_error = error_message.to_lowercase();

        if lower_error.contains("api key")
            || lower_error.contains("provider")
            || lower_error.contains("settings")
        {
            return EnhancedError::new("Configuration Error", error_message, ErrorType::Configuration)
                .with_suggestions(vec![
                    "Run `tamer --settings` to inspect the active configuration".to_string(),
                    "Edit settings.json in the tamer configuration directory".to_string(),
                ]);
        }

        if lower_error.contains("network")
            || lower_error.contains("timeout")
            || lower_error.contains("connection")
        {
            return EnhancedError::new("Network Error", error_message, ErrorType::Network)
                .with_suggestions(vec![
                    "Check your internet connection".to_string(),
                    "Try again in a few moments".to_string(),
                ]);
        }

        if lower_error.contains("permission") || lower_error.contains("denied") {
            return EnhancedError::new("Permission Error", error_message, ErrorType::Permission)
                .with_suggestion("Check file permissions of the tamer configuration directory");
        }

        EnhancedError::new("Error", error_message, ErrorType::Unknown)
    }
}

/// User-facing explanation for each API failure category.
pub fn api_guidance(error: &ApiError) -> EnhancedError {
    match error.kind {
        ApiErrorKind::RateLimited => EnhancedError::new(
            "Rate Limit Exceeded",
            "The provider's request quota is exhausted.",
            ErrorType::Quota,
        )
        .with_suggestions(vec![
            "Wait a little and try again".to_string(),
            "Switch to another provider with current_llm".to_string(),
        ]),
        ApiErrorKind::BadRequest => EnhancedError::new(
            "Bad Request",
            format!("The provider rejected the request: {}", error.detail),
            ErrorType::Validation,
        )
        .with_suggestion("Check the model name in the provider settings"),
        ApiErrorKind::AuthFailed => EnhancedError::new(
            "Authentication Failed",
            format!("The provider refused the credentials: {}", error.detail),
            ErrorType::Configuration,
        )
        .with_suggestions(vec![
            "Check the API key for the current provider".to_string(),
            "Set the provider's api_key_env variable or api_key field".to_string(),
        ]),
        ApiErrorKind::ConnectionFailed => EnhancedError::new(
            "No Connection",
            format!("Could not reach the provider: {}", error.detail),
            ErrorType::Network,
        )
        .with_suggestions(vec![
            "Check your internet connection".to_string(),
            "Verify the provider endpoint URL".to_string(),
        ]),
        ApiErrorKind::PermissionDenied => EnhancedError::new(
            "Access Denied",
            "The provider does not serve your region or account.",
            ErrorType::Permission,
        )
        .with_suggestions(vec![
            "Use a VPN".to_string(),
            "Switch to another provider".to_string(),
        ]),
        ApiErrorKind::NotFound => EnhancedError::new(
            "Not Found",
            format!("The requested resource does not exist: {}", error.detail),
            ErrorType::Validation,
        )
        .with_suggestion("Check the provider endpoint URL"),
        ApiErrorKind::Unknown => {
            EnhancedError::new("API Error", error.to_string(), ErrorType::Unknown)
        }
    }
}

/// Common error constructors for frequently encountered errors
pub mod errors {
    use super::*;

    pub fn demo_file_unreadable(path: &str, reason: &str) -> EnhancedError {
        EnhancedError::new(
            "Demo Playback Failed",
            format!("Could not load demo session '{path}': {reason}"),
            ErrorType::Validation,
        )
        .with_suggestions(vec![
            "Check that the file exists and is a demo_session_NNN.json recording".to_string(),
            "Record a new session with --demo-record".to_string(),
        ])
    }

    pub fn no_recordings(dir: &str) -> EnhancedError {
        EnhancedError::new(
            "No Recordings",
            format!("No demo sessions found in {dir}."),
            ErrorType::Validation,
        )
        .with_suggestion("Record one with `tamer -d --demo-record`")
    }

    pub fn command_failed(reason: &str) -> EnhancedError {
        EnhancedError::new(
            "Command Failed",
            format!("The command could not be started: {reason}"),
            ErrorType::Runtime,
        )
    }
}
