//! Field-level validation for run configuration documents.
//!
//! Errors are collected through a [`ValidationContext`] so that one pass over
//! the document reports every problem at once instead of the first one.

use thiserror::Error;

/// Validation error with context about which field failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Field '{field}': {message}")]
    FieldError { field: String, message: String },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}': invalid format - {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}': invalid enum value '{value}'. Expected one of: {expected}")]
    InvalidEnum {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

impl ValidationError {
    /// Qualifies the error's field with `path`; a field that repeats the last
    /// path segment is not appended twice.
    fn within(mut self, path: &[String]) -> Self {
        if let ValidationError::FieldError { field, .. }
        | ValidationError::OutOfRange { field, .. }
        | ValidationError::InvalidFormat { field, .. }
        | ValidationError::InvalidEnum { field, .. } = &mut self
        {
            *field = match path.last() {
                None => field.clone(),
                Some(last) if last.as_str() == field.as_str() || field.is_empty() => {
                    path.join(".")
                }
                Some(_) => format!("{}.{}", path.join("."), field),
            };
        }
        self
    }
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation context for building error messages.
pub struct ValidationContext {
    field_path: Vec<String>,
    errors: Vec<ValidationError>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self {
            field_path: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Enter a nested field context.
    pub fn enter(&mut self, field: &str) {
        self.field_path.push(field.to_string());
    }

    /// Exit the current field context.
    pub fn exit(&mut self) {
        self.field_path.pop();
    }

    /// Get the current field path as a string.
    pub fn current_path(&self) -> String {
        self.field_path.join(".")
    }

    /// Add a validation error, qualifying its field with the current path.
    pub fn add_error(&mut self, error: ValidationError) {
        let error = error.within(&self.field_path);
        self.errors.push(error);
    }

    /// Add a field error with automatic path.
    pub fn field_error(&mut self, message: String) {
        self.errors.push(ValidationError::FieldError {
            field: self.current_path(),
            message,
        });
    }

    /// Records the error of `result`, if any, under the current path.
    pub fn check(&mut self, result: ValidationResult<()>) {
        if let Err(e) = result {
            self.add_error(e);
        }
    }

    /// Check if any errors were collected.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Get all collected errors.
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Consume the context and return a result.
    pub fn into_result(self) -> Result<(), ValidationError> {
        let mut errors = self.errors;
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => {
                let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                Err(ValidationError::Multiple(messages.join("; ")))
            }
        }
    }
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Validator for URLs.
pub struct UrlValidator;

impl UrlValidator {
    pub fn validate(url: &str) -> ValidationResult<()> {
        if url.is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: "url".to_string(),
                message: "URL cannot be empty".to_string(),
            });
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::InvalidFormat {
                field: "url".to_string(),
                message: format!("URL must start with http:// or https://, got: {}", url),
            });
        }

        if url.contains(' ') {
            return Err(ValidationError::InvalidFormat {
                field: "url".to_string(),
                message: "URL cannot contain spaces".to_string(),
            });
        }

        Ok(())
    }
}

/// Validator for numeric ranges.
pub struct RangeValidator;

impl RangeValidator {
    pub fn validate_u64(value: u64, min: u64, max: u64, field: &str) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_f64(value: f64, min: f64, max: f64, field: &str) -> ValidationResult<()> {
        // NaN fails both comparisons, reject it explicitly
        if value.is_nan() || value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_non_negative_f64(value: f64, field: &str) -> ValidationResult<()> {
        Self::validate_f64(value, 0.0, f64::MAX, field)
    }

    pub fn validate_positive_f64(value: f64, field: &str) -> ValidationResult<()> {
        if value.is_nan() || value <= 0.0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: "0.0 (exclusive)".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_probability(value: f64, field: &str) -> ValidationResult<()> {
        Self::validate_f64(value, 0.0, 1.0, field)
    }
}

/// Validator for HTTP methods.
pub struct HttpMethodValidator;

impl HttpMethodValidator {
    const VALID_METHODS: &'static [&'static str] =
        &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

    pub fn validate(method: &str) -> ValidationResult<()> {
        let method_upper = method.to_uppercase();
        if !Self::VALID_METHODS.contains(&method_upper.as_str()) {
            return Err(ValidationError::InvalidEnum {
                field: "method".to_string(),
                value: method.to_string(),
                expected: Self::VALID_METHODS.join(", "),
            });
        }
        Ok(())
    }
}

/// Validator for the scheduling sections.
pub struct ScheduleValidator;

impl ScheduleValidator {
    /// A stage may hold at zero RPS but never ask for a negative rate.
    pub fn validate_stage(target_rate: f64) -> ValidationResult<()> {
        RangeValidator::validate_non_negative_f64(target_rate, "targetRate")
    }

    pub fn validate_adaptive(
        initial_rate: f64,
        error_threshold_percent: f64,
        min_rate: f64,
        max_rate: f64,
    ) -> ValidationResult<()> {
        RangeValidator::validate_f64(error_threshold_percent, 0.0, 100.0, "errorThresholdPercent")?;
        RangeValidator::validate_non_negative_f64(min_rate, "minRate")?;
        RangeValidator::validate_non_negative_f64(max_rate, "maxRate")?;

        if min_rate > max_rate {
            return Err(ValidationError::FieldError {
                field: "adaptive".to_string(),
                message: format!(
                    "minRate ({}) must not exceed maxRate ({})",
                    min_rate, max_rate
                ),
            });
        }

        RangeValidator::validate_f64(initial_rate, min_rate, max_rate, "initialRate")
    }
}
