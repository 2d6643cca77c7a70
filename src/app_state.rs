use std::{error::Error, fmt::Display, num::ParseIntError};

use axum::{http::StatusCode, response::IntoResponse, Json};
use tokio_util::sync::CancellationToken;

use crate::{
    db::Db,
    events::EventBus,
    health::{dedup::DedupEngine, HealthEngine},
    providers::ProviderRegistry,
    scheduler::Scheduler,
    standalone::StandaloneSource,
    translation::{memory::TranslationMemory, Translator},
    wanted::{scanner::WantedScanner, searcher::WantedSearcher},
};

#[derive(Debug, Clone)]
pub struct AppState {
    pub db: &'static Db,
    pub providers: &'static ProviderRegistry,
    pub translator: &'static Translator,
    pub translation_memory: &'static TranslationMemory,
    pub events: &'static EventBus,
    pub scanner: &'static WantedScanner,
    pub searcher: &'static WantedSearcher,
    pub standalone: &'static StandaloneSource,
    pub health: &'static HealthEngine,
    pub dedup: &'static DedupEngine,
    pub scheduler: &'static Scheduler,
    pub cancellation_token: CancellationToken,
}

/// Error taxonomy shared by every subsystem. Kinds map onto HTTP statuses at
/// the API boundary and onto retry policy inside the searcher.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppErrorKind {
    /// Missing or invalid settings. Fatal at startup.
    Configuration,
    /// Network timeout, 5xx, circuit open. Retried with backoff.
    TransientExternal,
    /// 4xx, unsupported format. Counted against the item, never retried.
    PermanentExternal,
    /// Subtitle failed parsing or validation. Rejected without retry.
    ContentInvalid,
    /// Status claim lost to another worker. Silently skipped.
    Contention,
    NotFound,
    BadRequest,
    /// Bug or invariant violation.
    Internal,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AppError {
    pub message: String,
    #[serde(skip)]
    pub kind: AppErrorKind,
}

impl Error for AppError {}

impl Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            AppErrorKind::Configuration => write!(f, "Configuration error: {}", self.message),
            AppErrorKind::TransientExternal => write!(f, "Transient error: {}", self.message),
            AppErrorKind::PermanentExternal => write!(f, "Permanent error: {}", self.message),
            AppErrorKind::ContentInvalid => write!(f, "Invalid content: {}", self.message),
            AppErrorKind::Contention => write!(f, "Contention: {}", self.message),
            AppErrorKind::NotFound => write!(f, "Not Found: {}", self.message),
            AppErrorKind::BadRequest => write!(f, "Bad Request: {}", self.message),
            AppErrorKind::Internal => write!(f, "Internal Error: {}", self.message),
        }
    }
}

impl From<AppErrorKind> for StatusCode {
    fn from(val: AppErrorKind) -> Self {
        match val {
            AppErrorKind::NotFound => StatusCode::NOT_FOUND,
            AppErrorKind::BadRequest | AppErrorKind::ContentInvalid => StatusCode::BAD_REQUEST,
            AppErrorKind::Contention => StatusCode::CONFLICT,
            AppErrorKind::TransientExternal | AppErrorKind::PermanentExternal => {
                StatusCode::BAD_GATEWAY
            }
            AppErrorKind::Configuration | AppErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            kind: AppErrorKind::Internal,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => AppError {
                message: "Database row not found".to_string(),
                kind: AppErrorKind::NotFound,
            },
            rest => AppError {
                message: format!("{}", rest),
                kind: AppErrorKind::Internal,
            },
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => AppError {
                message: value.to_string(),
                kind: AppErrorKind::NotFound,
            },
            std::io::ErrorKind::TimedOut => AppError {
                message: value.to_string(),
                kind: AppErrorKind::TransientExternal,
            },
            _ => AppError {
                message: value.to_string(),
                kind: AppErrorKind::Internal,
            },
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        let kind = if value.is_timeout() || value.is_connect() {
            AppErrorKind::TransientExternal
        } else if let Some(status) = value.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                AppErrorKind::TransientExternal
            } else {
                AppErrorKind::PermanentExternal
            }
        } else {
            AppErrorKind::TransientExternal
        };
        AppError {
            message: value.to_string(),
            kind,
        }
    }
}

impl From<ParseIntError> for AppError {
    fn from(value: ParseIntError) -> Self {
        AppError {
            message: value.to_string(),
            kind: AppErrorKind::BadRequest,
        }
    }
}

impl AppError {
    pub fn new(message: impl AsRef<str>, kind: AppErrorKind) -> Self {
        Self {
            message: message.as_ref().into(),
            kind,
        }
    }

    pub fn not_found(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::NotFound)
    }

    pub fn bad_request(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::BadRequest)
    }

    pub fn internal_error(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::Internal)
    }

    pub fn configuration(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::Configuration)
    }

    pub fn transient(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::TransientExternal)
    }

    pub fn permanent(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::PermanentExternal)
    }

    pub fn content_invalid(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::ContentInvalid)
    }

    pub fn contention(msg: impl AsRef<str>) -> AppError {
        Self::new(msg, AppErrorKind::Contention)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == AppErrorKind::TransientExternal
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status: StatusCode = self.kind.clone().into();
        (status, Json(self)).into_response()
    }
}
