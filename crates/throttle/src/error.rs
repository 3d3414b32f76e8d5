use thiserror::Error;

pub type Result<T, E = ThrottleError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ThrottleError {
    /// The session was never subscribed, or has since been unsubscribed.
    #[error("session {session} is not subscribed for analysis")]
    NotSubscribed { session: String },

    #[error("analysis period must be a non-zero whole number of milliseconds")]
    InvalidPeriod,

    #[error("smoothing factor must be in the open interval (0, 1), got {0}")]
    InvalidSmoothingFactor(f64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to read configuration file: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("analysis scheduler is no longer running")]
    SchedulerStopped,

    #[error("no tokio runtime available to run the analysis scheduler")]
    NoRuntime,
}

impl ThrottleError {
    pub(crate) fn not_subscribed(session: &impl std::fmt::Debug) -> Self {
        Self::NotSubscribed {
            session: format!("{session:?}"),
        }
    }
}
