use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Worth to retry later (connection, timeout, server side errors)
    #[error("Transient error: {0}")]
    Transient(String),
    /// API refused the event, retry would give same result
    #[error("Rejected ({0}): {1}")]
    Rejected(u16, String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP error status
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            408 | 429 | 500..=599 => Self::Transient(format!("HTTP {} {}", status, message)),
            _ => Self::Rejected(status, message),
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() {
            return Self::Transient(format!("Connection error: {}", error));
        }

        if error.is_timeout() {
            return Self::Transient(format!("Timeout error: {}", error));
        }

        if let Some(status) = error.status() {
            return Self::from_status(status.as_u16(), error.to_string());
        }

        if error.is_builder() {
            return Self::Rejected(0, format!("Invalid request: {}", error));
        }

        Self::Transient(error.to_string())
    }
}
