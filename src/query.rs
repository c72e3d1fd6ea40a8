//! Typed queries against the tracing backend's GraphQL API.
//!
//! Three query shapes, all blocking request/response with no state:
//! list services in a window, search a service's endpoints, and fetch the
//! call topology centered on one endpoint.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration as StdDuration;

/// Time window with a granularity step. An empty `step` means the caller has
/// not chosen one; the engine defaults it to `DAY` before querying.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Duration {
    pub start: String,
    pub end: String,
    pub step: String,
}

/// A deployable unit known to the tracing backend.
#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
}

/// Unmerged, unfiltered endpoint as returned by the search query.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEndpoint {
    pub id: String,
    pub name: String,
}

/// A node in an endpoint's call graph. `is_real` distinguishes traced
/// components from synthetic aggregation nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyNode {
    pub id: String,
    pub name: String,
    #[allow(dead_code)]
    pub service_id: String,
    pub service_name: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    pub node_type: Option<String>,
    pub is_real: bool,
}

/// A directed call observed between two topology node ids. Carries the full
/// backend field set; the engine only consults `source` and `target`.
#[allow(dead_code)]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub detect_points: Vec<String>,
    #[serde(default)]
    pub source_components: Vec<String>,
    #[serde(default)]
    pub target_components: Vec<String>,
}

/// The local call graph the backend returns for one endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointTopology {
    #[serde(default)]
    pub nodes: Vec<TopologyNode>,
    #[serde(default)]
    pub calls: Vec<CallEdge>,
}

/// The RPC boundary the aggregation engine traverses through.
///
/// Every call is a blocking round-trip; any transport or protocol failure is
/// fatal to the run and is surfaced as-is (no retry at this layer).
pub trait TraceBackend {
    fn services(&self, duration: &Duration) -> Result<Vec<Service>>;

    /// `keyword` may be empty to match all; `limit` bounds the result count.
    fn search_endpoints(
        &self,
        service_id: &str,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<RawEndpoint>>;

    fn endpoint_topology(&self, endpoint_id: &str, duration: &Duration) -> Result<EndpointTopology>;
}

const SERVICES_QUERY: &str = r#"
    query ($duration: Duration!) {
        services: getAllServices(duration: $duration) {
            id name
        }
    }
"#;

const ENDPOINTS_QUERY: &str = r#"
    query ($keyword: String!, $serviceId: ID!, $limit: Int!) {
        result: findEndpoint(keyword: $keyword, serviceId: $serviceId, limit: $limit) {
            id name
        }
    }
"#;

const TOPOLOGY_QUERY: &str = r#"
    query ($endpointId: ID!, $duration: Duration!) {
        result: getEndpointDependencies(duration: $duration, endpointId: $endpointId) {
            nodes {
                id
                name
                serviceId
                serviceName
                type
                isReal
            }
            calls {
                id
                source
                target
                detectPoints
                sourceComponents
                targetComponents
            }
        }
    }
"#;

#[derive(Debug, Deserialize)]
pub(crate) struct GraphqlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphqlError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ServicesData {
    services: Vec<Service>,
}

#[derive(Debug, Deserialize)]
struct EndpointsData {
    result: Vec<RawEndpoint>,
}

#[derive(Debug, Deserialize)]
struct TopologyData {
    result: EndpointTopology,
}

/// Blocking GraphQL client for the tracing backend.
///
/// Attaches the configured static headers to every request and shares one
/// execution path that fails fast on HTTP status errors, transport errors,
/// and GraphQL-level `errors` entries.
#[derive(Debug)]
pub struct GraphqlClient {
    url: String,
    headers: HashMap<String, String>,
    debug: bool,
    agent: ureq::Agent,
}

impl GraphqlClient {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>, debug: bool) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(StdDuration::from_secs(10))
            .timeout_read(StdDuration::from_secs(30))
            .timeout_write(StdDuration::from_secs(30))
            .build();
        Self {
            url: url.into(),
            headers,
            debug,
            agent,
        }
    }

    fn execute<T: DeserializeOwned>(&self, query: &str, variables: serde_json::Value) -> Result<T> {
        if self.debug {
            eprintln!("[debug] client: POST {}", self.url);
        }

        let mut request = self
            .agent
            .post(&self.url)
            .set("Accept", "application/json");
        for (k, v) in &self.headers {
            request = request.set(k, v);
        }

        let body = serde_json::json!({ "query": query, "variables": variables });
        let resp = match request.send_json(body) {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                return Err(anyhow!(
                    "request failed: {}: HTTP {}: {}",
                    self.url,
                    code,
                    body
                ));
            }
            Err(e) => return Err(anyhow!("request failed: {}: {}", self.url, e)),
        };

        let envelope: GraphqlResponse<T> = resp
            .into_json()
            .map_err(|e| anyhow!("failed to parse JSON from {}: {}", self.url, e))?;
        if let Some(err) = envelope.errors.first() {
            return Err(anyhow!("query failed: {}: {}", self.url, err.message));
        }
        envelope
            .data
            .ok_or_else(|| anyhow!("query returned no data: {}", self.url))
    }
}

impl TraceBackend for GraphqlClient {
    fn services(&self, duration: &Duration) -> Result<Vec<Service>> {
        let data: ServicesData =
            self.execute(SERVICES_QUERY, serde_json::json!({ "duration": duration }))?;
        Ok(data.services)
    }

    fn search_endpoints(
        &self,
        service_id: &str,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<RawEndpoint>> {
        let data: EndpointsData = self.execute(
            ENDPOINTS_QUERY,
            serde_json::json!({
                "serviceId": service_id,
                "keyword": keyword,
                "limit": limit,
            }),
        )?;
        Ok(data.result)
    }

    fn endpoint_topology(&self, endpoint_id: &str, duration: &Duration) -> Result<EndpointTopology> {
        let data: TopologyData = self.execute(
            TOPOLOGY_QUERY,
            serde_json::json!({
                "endpointId": endpoint_id,
                "duration": duration,
            }),
        )?;
        Ok(data.result)
    }
}
