//! Weighted endpoint selection for admitted requests.
//!
//! Each admitted tick picks one configured endpoint by weight and cuts a
//! [`RequestDescriptor`] from it. The selector is immutable after construction
//! and is owned by the generation loop.

use rand::Rng;
use thiserror::Error;

use crate::request::{Endpoint, RequestDescriptor};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("At least one endpoint must be configured")]
    Empty,

    #[error("Endpoint '{name}' has invalid weight {weight}; weights must be positive")]
    InvalidWeight { name: String, weight: f64 },
}

/// Chooses endpoints by weighted random distribution.
///
/// # Example
/// ```
/// use reqwest::header::HeaderMap;
/// use reqwest::Method;
/// use rust_loadgen::endpoints::EndpointSelector;
/// use rust_loadgen::request::Endpoint;
///
/// let get = |name: &str, url: &str| {
///     Endpoint::http(name, Method::GET, url, HeaderMap::new(), None)
/// };
/// let products = get("products", "http://shop/products");
/// let product = get("product", "http://shop/products/1");
///
/// let selector = EndpointSelector::new(vec![(products, 60.0), (product, 20.0)]).unwrap();
/// let request = selector.next_request();
/// // 75% chance of "products", 25% chance of "product"
/// # assert!(["products", "product"].contains(&&*request.category));
/// ```
#[derive(Debug, Clone)]
pub struct EndpointSelector {
    endpoints: Vec<Endpoint>,
    cumulative_weights: Vec<f64>,
    total_weight: f64,
}

impl EndpointSelector {
    /// Builds a selector over `(endpoint, weight)` pairs.
    pub fn new(weighted: Vec<(Endpoint, f64)>) -> Result<Self, SelectorError> {
        if weighted.is_empty() {
            return Err(SelectorError::Empty);
        }

        let mut endpoints = Vec::with_capacity(weighted.len());
        let mut cumulative = Vec::with_capacity(weighted.len());
        let mut sum = 0.0;

        for (endpoint, weight) in weighted {
            if !(weight.is_finite() && weight > 0.0) {
                return Err(SelectorError::InvalidWeight {
                    name: endpoint.name().to_string(),
                    weight,
                });
            }
            sum += weight;
            cumulative.push(sum);
            endpoints.push(endpoint);
        }

        Ok(Self {
            endpoints,
            cumulative_weights: cumulative,
            total_weight: sum,
        })
    }

    /// Every endpoint gets the same share of traffic.
    pub fn uniform(endpoints: Vec<Endpoint>) -> Result<Self, SelectorError> {
        Self::new(endpoints.into_iter().map(|e| (e, 1.0)).collect())
    }

    /// Select an endpoint based on weighted random distribution.
    pub fn select(&self) -> &Endpoint {
        if self.endpoints.len() == 1 {
            return &self.endpoints[0];
        }

        let random = rand::thread_rng().gen_range(0.0..self.total_weight);
        self.select_at(random)
    }

    /// Endpoint whose cumulative weight bracket contains `point`.
    fn select_at(&self, point: f64) -> &Endpoint {
        let index = self
            .cumulative_weights
            .binary_search_by(|weight| {
                if *weight <= point {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            })
            .unwrap_or_else(|i| i);

        &self.endpoints[index.min(self.endpoints.len() - 1)]
    }

    /// Selects an endpoint and cuts a descriptor for one request.
    pub fn next_request(&self) -> RequestDescriptor {
        self.select().descriptor()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Selection probability for each endpoint, in configuration order.
    pub fn probabilities(&self) -> Vec<(String, f64)> {
        let mut previous = 0.0;
        self.endpoints
            .iter()
            .zip(self.cumulative_weights.iter())
            .map(|(endpoint, cumulative)| {
                let probability = (cumulative - previous) / self.total_weight;
                previous = *cumulative;
                (endpoint.name().to_string(), probability)
            })
            .collect()
    }
}
