use std::{error::Error, fmt};

use serenity::{gateway::GatewayError, http::HttpError};

#[derive(Debug, Clone)]
pub struct BotError {
    details: String,
}

impl BotError {
    pub fn new(msg: &str) -> BotError {
        BotError {
            details: msg.to_string(),
        }
    }
}

impl fmt::Display for BotError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Rolekeeper crashed: {}", self.details)
    }
}

impl Error for BotError {}

impl From<serenity::Error> for BotError {
    fn from(err: serenity::Error) -> Self {
        BotError::new(&err.to_string())
    }
}

impl From<RoleError> for BotError {
    fn from(err: RoleError) -> Self {
        BotError::new(&err.to_string())
    }
}

impl From<anyhow::Error> for BotError {
    fn from(err: anyhow::Error) -> Self {
        BotError::new(&err.to_string())
    }
}

/// Failure of a single role mutation request, sorted by whether it is worth
/// retrying.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleError {
    RateLimited,
    Transient(String),
    NotFound(String),
    Permanent(String),
}

impl RoleError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RoleError::RateLimited | RoleError::Transient(_))
    }
}

impl Error for RoleError {}

impl fmt::Display for RoleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RoleError::RateLimited => write!(f, "rate limited"),
            RoleError::Transient(details) => write!(f, "transient failure: {}", details),
            RoleError::NotFound(details) => write!(f, "not found: {}", details),
            RoleError::Permanent(details) => write!(f, "{}", details),
        }
    }
}

impl From<serenity::Error> for RoleError {
    fn from(err: serenity::Error) -> Self {
        match err {
            serenity::Error::Http(http_err) => match *http_err {
                HttpError::UnsuccessfulRequest(response) => {
                    let status = response.status_code;
                    let details = format!("{} ({})", response.error.message, status.as_u16());
                    match status.as_u16() {
                        // serenity's ratelimiter already waited out the bucket
                        // it knew about, so there is no retry_after left to read
                        429 => RoleError::RateLimited,
                        404 => RoleError::NotFound(details),
                        _ if status.is_server_error() => RoleError::Transient(details),
                        _ => RoleError::Permanent(details),
                    }
                }
                HttpError::Request(e) => RoleError::Transient(e.to_string()),
                other => RoleError::Permanent(other.to_string()),
            },
            serenity::Error::Io(e) => RoleError::Transient(e.to_string()),
            serenity::Error::Gateway(e) => RoleError::Transient(e.to_string()),
            other => RoleError::Permanent(other.to_string()),
        }
    }
}

/// Errors from which a new gateway session cannot recover: retrying with the
/// same token and intents would fail the same way.
pub fn is_fatal_session_error(err: &serenity::Error) -> bool {
    match err {
        serenity::Error::Gateway(e) => matches!(
            e,
            GatewayError::InvalidAuthentication
                | GatewayError::DisallowedGatewayIntents
                | GatewayError::InvalidGatewayIntents
                | GatewayError::InvalidShardData
                | GatewayError::OverloadedShard
        ),
        serenity::Error::Http(http_err) => match http_err.as_ref() {
            HttpError::UnsuccessfulRequest(response) => response.status_code.as_u16() == 401,
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_and_transient_errors_retry() {
        assert!(RoleError::RateLimited.is_retryable());
        assert!(RoleError::Transient("502".into()).is_retryable());
        assert!(!RoleError::NotFound("Unknown Member".into()).is_retryable());
        assert!(!RoleError::Permanent("Missing Permissions".into()).is_retryable());
    }

    #[test]
    fn gateway_auth_failures_are_fatal() {
        assert!(is_fatal_session_error(&serenity::Error::Gateway(
            GatewayError::InvalidAuthentication
        )));
        assert!(is_fatal_session_error(&serenity::Error::Gateway(
            GatewayError::DisallowedGatewayIntents
        )));
        assert!(!is_fatal_session_error(&serenity::Error::Gateway(
            GatewayError::HeartbeatFailed
        )));
    }

    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(RoleError::from(serenity::Error::Io(io)).is_retryable());
    }
}
