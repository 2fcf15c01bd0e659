//! Run configuration documents.
//!
//! One JSON or YAML document (chosen by file extension) with camelCase keys.
//! [`LoadgenConfig::resolve`] validates the whole document, collecting every
//! field error, and turns it into the [`RunConfig`] the engine consumes.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::client::{ClientConfig, ConnectionPoolConfig};
use crate::config_validation::{
    HttpMethodValidator, RangeValidator, ScheduleValidator, UrlValidator, ValidationContext,
    ValidationError,
};
use crate::endpoints::{EndpointSelector, SelectorError};
use crate::rate_controller::{AdaptiveParameters, RateRounding, Schedule, Stage};
use crate::recorder::RecorderConfig;
use crate::request::Endpoint;
use crate::worker::{ThinkTime, WorkerPoolConfig};

/// Errors that can occur when loading or resolving a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {}: {source}", .path.display())]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Exactly one of 'load.stages' or 'load.adaptive' must be configured ({0})")]
    AmbiguousSchedule(&'static str),

    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid endpoint set: {0}")]
    Endpoints(#[from] SelectorError),
}

/// Document format, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// `.yaml` and `.yml` are YAML; anything else is read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Json,
        }
    }
}

/// Duration as integer seconds or a string with a unit ("250ms", "30s", "10m").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> Result<Duration, String> {
        match self {
            DurationValue::Seconds(s) => Ok(Duration::from_secs(*s)),
            DurationValue::Text(s) => crate::utils::parse_duration_string(s)
                .map_err(|e| format!("Invalid duration '{}': {}", s, e)),
        }
    }
}

impl From<&str> for DurationValue {
    fn from(s: &str) -> Self {
        DurationValue::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlSection {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSection {
    /// Category tag for outcome attribution.
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graphql: Option<GraphQlSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSection {
    /// Sent with every request; endpoint headers take precedence.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub endpoints: Vec<EndpointSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSection {
    pub duration: DurationValue,
    pub target_rate: f64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdaptiveSection {
    pub initial_rate: f64,
    pub error_threshold_percent: f64,
    pub increase_percent: f64,
    pub decrease_percent: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub sampling_window: DurationValue,
    pub stabilization_window: DurationValue,
}

impl Default for AdaptiveSection {
    fn default() -> Self {
        Self {
            initial_rate: 10.0,
            error_threshold_percent: 2.0,
            increase_percent: 25.0,
            decrease_percent: 15.0,
            min_rate: 5.0,
            max_rate: 500.0,
            sampling_window: "5s".into(),
            stabilization_window: "15s".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageSection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveSection>,
    /// Overall bound, applied in either mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<DurationValue>,
    /// Staged mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_rate: Option<f64>,
    #[serde(default)]
    pub rate_rounding: RateRounding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkTimeSection {
    pub min: DurationValue,
    pub max: DurationValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSection {
    pub workers: usize,
    pub queue_capacity: usize,
    pub reporting_interval: DurationValue,
    pub request_timeout: DurationValue,
    pub drain_timeout: DurationValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think_time: Option<ThinkTimeSection>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: 200,
            queue_capacity: 5000,
            reporting_interval: DurationValue::Seconds(5),
            request_timeout: DurationValue::Seconds(10),
            drain_timeout: DurationValue::Seconds(30),
            think_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplingSection {
    pub latency_sample_rate: f64,
    pub failure_sample_cap: usize,
    pub log_errors: bool,
    pub error_sample_rate: f64,
    /// Failure samples shown in each periodic report.
    pub report_failure_samples: usize,
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            latency_sample_rate: 0.1,
            failure_sample_cap: 100,
            log_errors: true,
            error_sample_rate: 0.1,
            report_failure_samples: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSection {
    pub skip_tls_verify: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_target_addr: Option<String>,
    pub max_idle_per_host: usize,
    pub idle_timeout: DurationValue,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            skip_tls_verify: false,
            resolve_target_addr: None,
            max_idle_per_host: 32,
            idle_timeout: DurationValue::Seconds(90),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

/// The configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadgenConfig {
    pub target: TargetSection,
    pub load: LoadSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub sampling: SamplingSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub output: OutputSection,
}

/// Everything the engine needs for one run, validated.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub selector: EndpointSelector,
    pub schedule: Schedule,
    pub duration: Option<Duration>,
    pub pool: WorkerPoolConfig,
    pub reporting_interval: Duration,
    pub drain_timeout: Duration,
    pub recorder: RecorderConfig,
    pub report_failure_samples: usize,
    pub client: ClientConfig,
    pub results_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl LoadgenConfig {
    /// Load a configuration file; the extension picks the format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, ConfigFormat::from_path(path))
    }

    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        match format {
            ConfigFormat::Json => Self::from_json_str(content),
            ConfigFormat::Yaml => Self::from_yaml_str(content),
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// The reference adaptive profile written when no configuration exists.
    pub fn default_template() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_string(), "application/json".to_string());

        Self {
            target: TargetSection {
                headers,
                endpoints: vec![
                    EndpointSection {
                        name: "products".to_string(),
                        url: "https://shop.example.com/store/products".to_string(),
                        method: default_method(),
                        headers: BTreeMap::new(),
                        body: None,
                        graphql: None,
                        weight: Some(60.0),
                    },
                    EndpointSection {
                        name: "categories".to_string(),
                        url: "https://shop.example.com/store/product-categories".to_string(),
                        method: default_method(),
                        headers: BTreeMap::new(),
                        body: None,
                        graphql: None,
                        weight: Some(20.0),
                    },
                ],
            },
            load: LoadSection {
                stages: None,
                adaptive: Some(AdaptiveSection::default()),
                duration: Some("10m".into()),
                start_rate: None,
                rate_rounding: RateRounding::Integer,
            },
            pool: PoolSection::default(),
            sampling: SamplingSection::default(),
            client: ClientSection::default(),
            output: OutputSection {
                results_file: Some(PathBuf::from("results.json")),
                metrics_port: None,
            },
        }
    }

    /// Serialize in the format implied by `path` and write it there.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = match ConfigFormat::from_path(path) {
            ConfigFormat::Json => serde_json::to_string_pretty(self)? + "\n",
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(path, content).map_err(|source| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate the document and build the run plan.
    pub fn resolve(&self) -> Result<RunConfig, ConfigError> {
        match (&self.load.stages, &self.load.adaptive) {
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousSchedule("both are set")),
            (None, None) => return Err(ConfigError::AmbiguousSchedule("neither is set")),
            _ => {}
        }

        let mut ctx = ValidationContext::new();

        ctx.enter("target");
        let endpoints = self.resolve_endpoints(&mut ctx);
        ctx.exit();

        ctx.enter("load");
        let schedule = self.resolve_schedule(&mut ctx);
        let duration = self
            .load
            .duration
            .as_ref()
            .map(|d| duration_field(&mut ctx, "duration", d));
        if let Some(start_rate) = self.load.start_rate {
            ctx.enter("startRate");
            ctx.check(RangeValidator::validate_non_negative_f64(start_rate, "startRate"));
            ctx.exit();
        }
        ctx.exit();

        ctx.enter("pool");
        let pool = &self.pool;
        ctx.enter("workers");
        ctx.check(RangeValidator::validate_u64(pool.workers as u64, 1, 100_000, "workers"));
        ctx.exit();
        let reporting_interval =
            positive_duration_field(&mut ctx, "reportingInterval", &pool.reporting_interval);
        let request_timeout =
            positive_duration_field(&mut ctx, "requestTimeout", &pool.request_timeout);
        let drain_timeout = duration_field(&mut ctx, "drainTimeout", &pool.drain_timeout);
        let think_time = pool.think_time.as_ref().map(|t| {
            ctx.enter("thinkTime");
            let think = ThinkTime {
                min: duration_field(&mut ctx, "min", &t.min),
                max: duration_field(&mut ctx, "max", &t.max),
            };
            if think.min > think.max {
                ctx.field_error("min must not exceed max".to_string());
            }
            ctx.exit();
            think
        });
        ctx.exit();

        ctx.enter("sampling");
        ctx.check(RangeValidator::validate_probability(
            self.sampling.latency_sample_rate,
            "latencySampleRate",
        ));
        ctx.check(RangeValidator::validate_probability(
            self.sampling.error_sample_rate,
            "errorSampleRate",
        ));
        ctx.exit();

        ctx.enter("client");
        let idle_timeout = duration_field(&mut ctx, "idleTimeout", &self.client.idle_timeout);
        ctx.exit();

        ctx.into_result()?;

        let schedule = schedule.ok_or(ConfigError::AmbiguousSchedule("neither is set"))?;
        let selector = EndpointSelector::new(endpoints)?;

        Ok(RunConfig {
            selector,
            schedule,
            duration,
            pool: WorkerPoolConfig {
                workers: pool.workers,
                queue_capacity: pool.queue_capacity,
                think_time,
            },
            reporting_interval,
            drain_timeout,
            recorder: RecorderConfig {
                latency_sample_rate: self.sampling.latency_sample_rate,
                failure_sample_cap: self.sampling.failure_sample_cap,
                log_errors: self.sampling.log_errors,
                error_sample_rate: self.sampling.error_sample_rate,
            },
            report_failure_samples: self.sampling.report_failure_samples,
            client: ClientConfig {
                request_timeout,
                skip_tls_verify: self.client.skip_tls_verify,
                resolve_target_addr: self.client.resolve_target_addr.clone(),
                pool: ConnectionPoolConfig {
                    max_idle_per_host: self.client.max_idle_per_host,
                    idle_timeout,
                    ..ConnectionPoolConfig::default()
                },
            },
            results_file: self.output.results_file.clone(),
            metrics_port: self.output.metrics_port,
        })
    }

    fn resolve_endpoints(&self, ctx: &mut ValidationContext) -> Vec<(Endpoint, f64)> {
        let global_headers = header_map(ctx, "headers", &self.target.headers);

        ctx.enter("endpoints");
        if self.target.endpoints.is_empty() {
            ctx.field_error("At least one endpoint must be configured".to_string());
        }

        let mut endpoints = Vec::with_capacity(self.target.endpoints.len());
        for (idx, section) in self.target.endpoints.iter().enumerate() {
            ctx.enter(&format!("[{}]", idx));

            if section.name.is_empty() {
                ctx.enter("name");
                ctx.field_error("Endpoint name cannot be empty".to_string());
                ctx.exit();
            }

            ctx.enter("url");
            ctx.check(UrlValidator::validate(&section.url));
            ctx.exit();

            let weight = section.weight.unwrap_or(1.0);
            ctx.enter("weight");
            ctx.check(RangeValidator::validate_positive_f64(weight, "weight"));
            ctx.exit();

            let mut headers = global_headers.clone();
            headers.extend(header_map(ctx, "headers", &section.headers));

            let endpoint = match &section.graphql {
                Some(graphql) => {
                    if section.body.is_some() {
                        ctx.field_error("'body' and 'graphql' are mutually exclusive".to_string());
                    }
                    match Endpoint::graphql(
                        &section.name,
                        &section.url,
                        headers,
                        &graphql.query,
                        graphql.variables.as_ref(),
                    ) {
                        Ok(endpoint) => Some(endpoint),
                        Err(e) => {
                            ctx.enter("graphql");
                            ctx.field_error(format!("Cannot encode GraphQL payload: {}", e));
                            ctx.exit();
                            None
                        }
                    }
                }
                None => {
                    ctx.enter("method");
                    let method = match HttpMethodValidator::validate(&section.method) {
                        Ok(()) => Method::from_str(&section.method.to_uppercase()).ok(),
                        Err(e) => {
                            ctx.add_error(e);
                            None
                        }
                    };
                    ctx.exit();
                    method.map(|method| {
                        Endpoint::http(
                            &section.name,
                            method,
                            &section.url,
                            headers,
                            section.body.clone(),
                        )
                    })
                }
            };

            if let Some(endpoint) = endpoint {
                endpoints.push((endpoint, weight));
            }
            ctx.exit();
        }
        ctx.exit();

        endpoints
    }

    fn resolve_schedule(&self, ctx: &mut ValidationContext) -> Option<Schedule> {
        if let Some(stage_sections) = &self.load.stages {
            ctx.enter("stages");
            if stage_sections.is_empty() {
                ctx.field_error("At least one stage must be configured".to_string());
            }

            let mut stages = Vec::with_capacity(stage_sections.len());
            for (idx, section) in stage_sections.iter().enumerate() {
                ctx.enter(&format!("[{}]", idx));
                let duration = duration_field(ctx, "duration", &section.duration);
                ctx.enter("targetRate");
                ctx.check(ScheduleValidator::validate_stage(section.target_rate));
                ctx.exit();
                stages.push(Stage {
                    duration,
                    target_rate: section.target_rate,
                    description: section.description.clone(),
                });
                ctx.exit();
            }
            ctx.exit();

            return Some(Schedule::Staged {
                stages,
                start_rate: self.load.start_rate,
            });
        }

        let adaptive = self.load.adaptive.as_ref()?;
        ctx.enter("adaptive");
        ctx.check(ScheduleValidator::validate_adaptive(
            adaptive.initial_rate,
            adaptive.error_threshold_percent,
            adaptive.min_rate,
            adaptive.max_rate,
        ));
        ctx.check(RangeValidator::validate_non_negative_f64(
            adaptive.increase_percent,
            "increasePercent",
        ));
        ctx.check(RangeValidator::validate_f64(
            adaptive.decrease_percent,
            0.0,
            100.0,
            "decreasePercent",
        ));
        let sampling_window =
            positive_duration_field(ctx, "samplingWindow", &adaptive.sampling_window);
        let stabilization_window =
            duration_field(ctx, "stabilizationWindow", &adaptive.stabilization_window);
        ctx.exit();

        Some(Schedule::Adaptive {
            params: AdaptiveParameters {
                initial_rate: adaptive.initial_rate,
                error_threshold_percent: adaptive.error_threshold_percent,
                increase_percent: adaptive.increase_percent,
                decrease_percent: adaptive.decrease_percent,
                min_rate: adaptive.min_rate,
                max_rate: adaptive.max_rate,
                sampling_window,
                stabilization_window,
            },
            rounding: self.load.rate_rounding,
        })
    }
}

/// Parses a duration field, recording the error and yielding zero on failure.
fn duration_field(ctx: &mut ValidationContext, field: &str, value: &DurationValue) -> Duration {
    ctx.enter(field);
    let duration = value.to_duration().unwrap_or_else(|e| {
        ctx.field_error(e);
        Duration::ZERO
    });
    ctx.exit();
    duration
}

fn positive_duration_field(
    ctx: &mut ValidationContext,
    field: &str,
    value: &DurationValue,
) -> Duration {
    ctx.enter(field);
    let duration = match value.to_duration() {
        Ok(d) if d.is_zero() => {
            ctx.field_error("Duration must be greater than zero".to_string());
            d
        }
        Ok(d) => d,
        Err(e) => {
            ctx.field_error(e);
            Duration::ZERO
        }
    };
    ctx.exit();
    duration
}

fn header_map(
    ctx: &mut ValidationContext,
    field: &str,
    headers: &BTreeMap<String, String>,
) -> HeaderMap {
    ctx.enter(field);
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let parsed_name = HeaderName::from_str(name.trim());
        let parsed_value = HeaderValue::from_str(value.trim());
        match (parsed_name, parsed_value) {
            (Ok(n), Ok(v)) => {
                map.insert(n, v);
            }
            (Err(e), _) => ctx.field_error(format!("Invalid header name '{}': {}", name, e)),
            (_, Err(e)) => ctx.field_error(format!("Invalid value for header '{}': {}", name, e)),
        }
    }
    ctx.exit();
    map
}
