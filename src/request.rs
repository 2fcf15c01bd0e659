//! Request descriptors handed from the rate controller to the worker pool.

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;

/// How a response body decides success beyond the status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCheck {
    /// Status code only; the body is streamed and discarded.
    StatusOnly,

    /// Body is parsed as a GraphQL response; a non-empty `errors` array fails
    /// the request even under HTTP 200.
    GraphQlErrors,
}

/// One request to issue. Immutable, consumed once by a worker.
///
/// All fields are shared with the endpoint template it was cut from, so
/// generating a descriptor per admitted tick only bumps reference counts.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Category tag used for outcome attribution (the endpoint name).
    pub category: Arc<str>,
    pub method: Method,
    pub url: Arc<str>,
    pub headers: Arc<HeaderMap>,
    pub body: Option<Arc<str>>,
    pub check: ResponseCheck,
}

#[derive(Serialize)]
struct GraphQlBody<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    variables: Option<&'a serde_json::Value>,
}

/// Encodes a GraphQL document as the JSON body of a POST request.
pub fn graphql_body(
    query: &str,
    variables: Option<&serde_json::Value>,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&GraphQlBody { query, variables })
}

/// Template from which descriptors for one endpoint are generated.
#[derive(Debug, Clone)]
pub struct Endpoint {
    template: RequestDescriptor,
}

impl Endpoint {
    /// A plain HTTP endpoint with an optional raw body.
    pub fn http(
        name: &str,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<String>,
    ) -> Self {
        Self {
            template: RequestDescriptor {
                category: Arc::from(name),
                method,
                url: Arc::from(url),
                headers: Arc::new(headers),
                body: body.map(Arc::from),
                check: ResponseCheck::StatusOnly,
            },
        }
    }

    /// A GraphQL endpoint: always POSTs a JSON `{query, variables}` document.
    pub fn graphql(
        name: &str,
        url: &str,
        mut headers: HeaderMap,
        query: &str,
        variables: Option<&serde_json::Value>,
    ) -> Result<Self, serde_json::Error> {
        let body = graphql_body(query, variables)?;
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));

        Ok(Self {
            template: RequestDescriptor {
                category: Arc::from(name),
                method: Method::POST,
                url: Arc::from(url),
                headers: Arc::new(headers),
                body: Some(Arc::from(body)),
                check: ResponseCheck::GraphQlErrors,
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.template.category
    }

    /// Cuts a fresh descriptor for one admitted request.
    pub fn descriptor(&self) -> RequestDescriptor {
        self.template.clone()
    }
}
