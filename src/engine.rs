//! Aggregation engine: builds a two-level call-dependency tree for a set of
//! named services.
//!
//! The traversal is strictly sequential: services, endpoints, and the two
//! hops of callers are resolved one at a time via blocking round-trips to
//! the backend. All state (filter set, merge rules, dependency cache) is
//! owned by one [`Aggregator`] instance, so isolated or repeated runs are
//! cheap to set up in tests.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::query::{Duration, TopologyNode, TraceBackend};

/// Endpoint search limit the engine passes to approximate "all".
pub const DEFAULT_SEARCH_LIMIT: usize = 1500;

/// Window granularity used when the caller leaves `step` empty.
pub const DEFAULT_STEP: &str = "DAY";

/// Synthetic node names filtered out by default: framework dispatch,
/// async-wrapper, and broker-callback markers.
pub const DEFAULT_FILTERED_NODES: [&str; 3] =
    ["UndertowDispatch", "SpringAsync", "Kafka/Producer/Callback"];

// Raw endpoint names carrying the legacy circuit-breaker call type are not
// routes; they are skipped before filtering or merging.
const LEGACY_CALL_PREFIX: &str = "Hystrix/";

// Gateway-internal nodes are excluded at every hop, independent of the
// configurable exclusion set.
const GATEWAY_INTERNAL_PREFIX: &str = "GATEWAY:";

/// Decides whether an endpoint or topology node name is eligible for the
/// tree. Seeded with [`DEFAULT_FILTERED_NODES`]; extendable before a run.
#[derive(Debug, Clone)]
pub struct NodeFilter {
    excluded: HashSet<String>,
}

impl Default for NodeFilter {
    fn default() -> Self {
        Self {
            excluded: DEFAULT_FILTERED_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl NodeFilter {
    pub fn exclude(&mut self, name: impl Into<String>) {
        self.excluded.insert(name.into());
    }

    pub fn is_eligible(&self, name: &str) -> bool {
        !name.starts_with(GATEWAY_INTERNAL_PREFIX) && !self.excluded.contains(name)
    }
}

/// One prefix-rewrite rule. An empty `name` means "use the prefix itself as
/// the canonical name".
#[derive(Debug, Clone, Deserialize)]
pub struct MergeRule {
    pub prefix: String,
    #[serde(default)]
    pub name: String,
}

/// Per-service prefix rules, in declaration order.
///
/// Contract: the first rule whose prefix matches wins. Callers with
/// overlapping prefixes must order them accordingly.
pub type MergeRules = HashMap<String, Vec<MergeRule>>;

/// Rewrites `name` when a prefix rule for `service` matches. Returns the
/// (possibly unchanged) name and whether a substitution occurred.
pub fn merge_name(service: &str, name: &str, rules: &MergeRules) -> (String, bool) {
    if let Some(rules) = rules.get(service) {
        for rule in rules {
            if name.starts_with(&rule.prefix) {
                let canonical = if rule.name.is_empty() {
                    rule.prefix.clone()
                } else {
                    rule.name.clone()
                };
                return (canonical, true);
            }
        }
    }
    (name.to_string(), false)
}

/// How dependency-cache keys are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheKeyPolicy {
    /// Key by endpoint id only. A long-lived process reuses caller sets
    /// across different requested windows; this trades temporal accuracy for
    /// one topology query per endpoint no matter how many roots reach it.
    #[default]
    EndpointOnly,
    /// Key by endpoint id and the full query window.
    EndpointAndWindow,
}

/// Memoizes the filtered caller list per endpoint. Unbounded, lives as long
/// as the owning engine; never invalidated or evicted.
#[derive(Debug, Default)]
pub struct DepsCache {
    policy: CacheKeyPolicy,
    entries: HashMap<String, Vec<TopologyNode>>,
}

impl DepsCache {
    pub fn new(policy: CacheKeyPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    fn key(&self, endpoint_id: &str, duration: &Duration) -> String {
        match self.policy {
            CacheKeyPolicy::EndpointOnly => endpoint_id.to_string(),
            CacheKeyPolicy::EndpointAndWindow => format!(
                "{}|{}|{}|{}",
                endpoint_id, duration.start, duration.end, duration.step
            ),
        }
    }

    /// The nodes that call *into* `endpoint_id`: sources of edges targeting
    /// it, restricted to real (non-synthetic) topology nodes. The first
    /// lookup fetches the topology; later lookups are served from memory.
    pub fn resolve_callers<B: TraceBackend>(
        &mut self,
        backend: &B,
        endpoint_id: &str,
        duration: &Duration,
    ) -> Result<Vec<TopologyNode>> {
        let key = self.key(endpoint_id, duration);
        if let Some(hit) = self.entries.get(&key) {
            return Ok(hit.clone());
        }

        let topology = backend.endpoint_topology(endpoint_id, duration)?;
        let callers: HashSet<String> = topology
            .calls
            .iter()
            .filter(|c| c.target == endpoint_id)
            .map(|c| c.source.clone())
            .collect();
        let nodes: Vec<TopologyNode> = topology
            .nodes
            .into_iter()
            .filter(|n| n.is_real && callers.contains(&n.id))
            .collect();

        self.entries.insert(key, nodes.clone());
        Ok(nodes)
    }
}

/// A node in the produced tree: a root endpoint, a direct caller, or a
/// caller-of-caller.
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    /// Backend endpoint id. Once `merged` is true this is the id of the
    /// first raw endpoint folded into the canonical name and is no longer
    /// 1:1 with any single backend endpoint.
    pub id: String,
    pub name: String,
    pub service_name: String,
    pub merged: bool,
    pub children: BTreeMap<String, Endpoint>,
}

impl Endpoint {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        service_name: impl Into<String>,
        merged: bool,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            service_name: service_name.into(),
            merged,
            children: BTreeMap::new(),
        }
    }

    fn from_node(node: &TopologyNode) -> Self {
        Self::new(&node.id, &node.name, &node.service_name, false)
    }

    /// Idempotent insert: re-adding an existing child id keeps and returns
    /// the previously stored child.
    pub fn attach(&mut self, child: Endpoint) -> &mut Endpoint {
        self.children.entry(child.id.clone()).or_insert(child)
    }
}

/// Per-service root endpoints, each with up to two levels of children.
pub type RouteMap = BTreeMap<String, Vec<Endpoint>>;

/// Engine construction knobs; everything the surrounding tool configures.
#[derive(Debug, Default)]
pub struct EngineConfig {
    pub merge_rules: MergeRules,
    /// Synthetic node names excluded on top of [`DEFAULT_FILTERED_NODES`].
    pub extra_filtered_nodes: Vec<String>,
    pub cache_policy: CacheKeyPolicy,
    /// Zero means [`DEFAULT_SEARCH_LIMIT`].
    pub search_limit: usize,
    pub debug: bool,
}

/// Drives the two-hop traversal and owns all mutable state for one run
/// lifetime (single-threaded; parallelizing would require synchronizing the
/// cache and a policy for concurrent misses on one key).
pub struct Aggregator<B> {
    backend: B,
    filter: NodeFilter,
    merge_rules: MergeRules,
    cache: DepsCache,
    search_limit: usize,
    debug: bool,
}

impl<B: TraceBackend> Aggregator<B> {
    pub fn new(backend: B, config: EngineConfig) -> Self {
        let mut filter = NodeFilter::default();
        for name in config.extra_filtered_nodes {
            filter.exclude(name);
        }
        let search_limit = if config.search_limit == 0 {
            DEFAULT_SEARCH_LIMIT
        } else {
            config.search_limit
        };
        Self {
            backend,
            filter,
            merge_rules: config.merge_rules,
            cache: DepsCache::new(config.cache_policy),
            search_limit,
            debug: config.debug,
        }
    }

    /// Builds the per-service list of root endpoints with direct callers and
    /// callers-of-callers attached. Any backend error aborts the whole build
    /// with no partial result.
    pub fn build_dependency_tree(
        &mut self,
        service_names: &[String],
        mut duration: Duration,
    ) -> Result<RouteMap> {
        if duration.step.is_empty() {
            duration.step = DEFAULT_STEP.to_string();
        }

        let wanted: HashSet<&str> = service_names.iter().map(String::as_str).collect();
        let services: Vec<_> = self
            .backend
            .services(&duration)?
            .into_iter()
            .filter(|s| wanted.contains(s.name.as_str()))
            .collect();

        let mut routes = RouteMap::new();
        // Canonical (service, name) -> index into that service's root list.
        let mut merged_roots: HashMap<(String, String), usize> = HashMap::new();

        for service in &services {
            let endpoints = self
                .backend
                .search_endpoints(&service.id, "", self.search_limit)?;

            for raw in endpoints {
                if raw.name.starts_with(LEGACY_CALL_PREFIX) || !self.filter.is_eligible(&raw.name)
                {
                    continue;
                }

                let (name, was_merged) = merge_name(&service.name, &raw.name, &self.merge_rules);

                let roots = routes.entry(service.name.clone()).or_default();
                let root_idx = if was_merged {
                    match merged_roots.get(&(service.name.clone(), name.clone())).copied() {
                        Some(idx) => {
                            roots[idx].merged = true;
                            idx
                        }
                        None => {
                            let idx = roots.len();
                            roots.push(Endpoint::new(&raw.id, &name, &service.name, true));
                            merged_roots.insert((service.name.clone(), name.clone()), idx);
                            idx
                        }
                    }
                } else {
                    roots.push(Endpoint::new(&raw.id, &name, &service.name, false));
                    roots.len() - 1
                };

                if self.debug {
                    eprintln!("[debug] {} ({})", service.name, name);
                }

                // Callers are resolved per raw endpoint id even when several
                // raw endpoints fold into one merged root.
                let callers = self
                    .cache
                    .resolve_callers(&self.backend, &raw.id, &duration)?;

                let root = &mut routes.get_mut(&service.name).expect("service entry")[root_idx];
                for caller in &callers {
                    if !self.filter.is_eligible(&caller.name) {
                        continue;
                    }
                    if self.debug {
                        eprintln!("[debug]\t<- {} ({})", caller.service_name, caller.name);
                    }

                    let grand_callers =
                        self.cache
                            .resolve_callers(&self.backend, &caller.id, &duration)?;

                    let child = root.attach(Endpoint::from_node(caller));
                    for grand in &grand_callers {
                        if !self.filter.is_eligible(&grand.name) {
                            continue;
                        }
                        if self.debug {
                            eprintln!("[debug]\t\t<- {} ({})", grand.service_name, grand.name);
                        }
                        child.attach(Endpoint::from_node(grand));
                    }
                }
            }
        }

        Ok(routes)
    }
}
