//! Outcome classification for requests issued by the worker pool.
//!
//! Every completed request is classified into exactly one category. Transport
//! failures (no response obtained) are kept distinct from HTTP error statuses,
//! and both are kept distinct from application errors embedded in an otherwise
//! successful response body.

use std::fmt;

/// Categories of failure that can occur during a load run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 4xx errors (client errors)
    ClientError,

    /// HTTP 5xx errors (server errors)
    ServerError,

    /// Network connectivity errors (DNS, connection refused, reset, etc.)
    NetworkError,

    /// Request timeout errors
    TimeoutError,

    /// TLS/SSL certificate errors
    TlsError,

    /// The transport succeeded but the body reported a failure
    /// (e.g. a GraphQL `errors` array under HTTP 200)
    ApplicationError,

    /// Other/unknown errors, including unexpected status codes (1xx, 3xx)
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Returns `None` for 2xx. Status `0` is reserved for transport failures and
    /// is reported as a network error.
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            0 => Some(ErrorCategory::NetworkError),
            200..=299 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a reqwest error raised before a response was obtained.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return ErrorCategory::TimeoutError;
        }

        // reqwest does not expose TLS failures as a kind, inspect the chain.
        let error_msg = error_chain_message(error).to_lowercase();
        if error_msg.contains("certificate")
            || error_msg.contains("tls")
            || error_msg.contains("ssl")
        {
            ErrorCategory::TlsError
        } else if error.is_connect() || error.is_request() || error.is_body() {
            ErrorCategory::NetworkError
        } else if error_msg.contains("timed out") || error_msg.contains("timeout") {
            ErrorCategory::TimeoutError
        } else if error_msg.contains("dns")
            || error_msg.contains("resolve")
            || error_msg.contains("connection")
        {
            ErrorCategory::NetworkError
        } else {
            ErrorCategory::OtherError
        }
    }

    /// Get the Prometheus label for this error category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::ApplicationError => "application_error",
            ErrorCategory::OtherError => "other_error",
        }
    }

    /// Get a human-readable description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "HTTP 4xx Client Errors",
            ErrorCategory::ServerError => "HTTP 5xx Server Errors",
            ErrorCategory::NetworkError => "Network/Connection Errors",
            ErrorCategory::TimeoutError => "Request Timeout Errors",
            ErrorCategory::TlsError => "TLS/SSL Certificate Errors",
            ErrorCategory::ApplicationError => "Application Errors in Response Body",
            ErrorCategory::OtherError => "Other/Unknown Errors",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Joins an error with all of its sources: "error sending request: connection refused".
pub fn error_chain_message(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_msg = cause.to_string();
        if !message.contains(&cause_msg) {
            message.push_str(": ");
            message.push_str(&cause_msg);
        }
        source = cause.source();
    }
    message
}

/// Maps a status code to the class label used in final reports.
///
/// Status `0` (no response) is `network_error`; everything else is `Nxx`.
pub fn status_class(status_code: u16) -> String {
    if status_code == 0 {
        "network_error".to_string()
    } else {
        format!("{}xx", status_code / 100)
    }
}

/// Helper to name common HTTP status codes for display.
pub fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        0 => "No Response",

        // 2xx Success
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",

        // 3xx Redirection
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",

        // 4xx Client Errors
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        429 => "Too Many Requests",

        // 5xx Server Errors
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",

        _ => "Unknown Status",
    }
}
