//! Read-only topology over saved endpoints
//!
//! Derived on demand from the saved-endpoint store and discarded after route
//! computation; never part of the live registry until a route is expanded.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::node::EndpointSpec;

/// Synthetic source vertex representing the local machine.
const LOCAL: &str = "local";

/// One saved endpoint as stored by the configuration layer.
///
/// `proxy_chain` lists the saved-endpoint ids of the jump hosts, ordered
/// outermost first; an empty chain means the endpoint is reachable directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedEndpoint {
    pub id: String,
    #[serde(flatten)]
    pub endpoint: EndpointSpec,
    #[serde(default)]
    pub proxy_chain: Vec<String>,
}

/// Read-only source of saved endpoints. The resolver never writes back.
pub trait SavedEndpointStore: Send + Sync {
    fn list(&self) -> Vec<SavedEndpoint>;
}

/// Simple store backed by a fixed list, in declaration order.
pub struct InMemoryEndpointStore {
    endpoints: Vec<SavedEndpoint>,
}

impl InMemoryEndpointStore {
    pub fn new(endpoints: Vec<SavedEndpoint>) -> Self {
        Self { endpoints }
    }
}

impl SavedEndpointStore for InMemoryEndpointStore {
    fn list(&self) -> Vec<SavedEndpoint> {
        self.endpoints.clone()
    }
}

/// Priority queue entry. Min-heap on cost, then on saved-endpoint insertion
/// order so equal-cost routes resolve deterministically.
#[derive(Eq, PartialEq)]
struct DijkstraState {
    cost: u32,
    order: usize,
    node: String,
}

impl Ord for DijkstraState {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .cmp(&self.cost)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for DijkstraState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Unit-weight digraph over saved endpoints plus the synthetic local source.
pub struct TopologyGraph {
    /// Saved endpoints keyed by id.
    nodes: HashMap<String, SavedEndpoint>,
    /// Insertion order of each saved endpoint, used for tie-breaking.
    order: HashMap<String, usize>,
    /// Adjacency in insertion order of the declaring endpoint.
    edges: HashMap<String, Vec<String>>,
}

impl TopologyGraph {
    /// Derive the graph from saved endpoints. Each proxy chain
    /// `[j1, j2, ...]` for target `t` contributes the edge path
    /// `local -> j1 -> j2 -> ... -> t`; an empty chain contributes
    /// `local -> t`. Chain entries naming unknown endpoints drop the
    /// affected edge.
    pub fn build(endpoints: &[SavedEndpoint]) -> Self {
        let mut nodes = HashMap::new();
        let mut order = HashMap::new();
        for (idx, ep) in endpoints.iter().enumerate() {
            nodes.insert(ep.id.clone(), ep.clone());
            order.insert(ep.id.clone(), idx);
        }

        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        let add_edge = |edges: &mut HashMap<String, Vec<String>>, from: &str, to: &str| {
            let list = edges.entry(from.to_string()).or_default();
            if !list.iter().any(|t| t == to) {
                list.push(to.to_string());
            }
        };

        for ep in endpoints {
            let mut prev = LOCAL.to_string();
            for hop in &ep.proxy_chain {
                if !nodes.contains_key(hop) {
                    warn!(endpoint = %ep.id, hop = %hop, "Proxy chain names an unknown endpoint, dropping edge");
                    prev = hop.clone();
                    continue;
                }
                add_edge(&mut edges, &prev, hop);
                prev = hop.clone();
            }
            add_edge(&mut edges, &prev, &ep.id);
        }

        Self {
            nodes,
            order,
            edges,
        }
    }

    pub fn endpoint(&self, id: &str) -> Option<&SavedEndpoint> {
        self.nodes.get(id)
    }

    /// Shortest hop path from local to the target, as saved-endpoint ids
    /// ordered root-first and including the target itself.
    ///
    /// Unit edge weights minimise hop count; equal-cost alternatives settle
    /// in saved-endpoint insertion order, so the result is stable across
    /// runs for the same store contents.
    pub fn compute_route(&self, target_id: &str) -> Result<Vec<String>> {
        if !self.nodes.contains_key(target_id) {
            return Err(CoreError::NotFound(format!(
                "saved endpoint {}",
                target_id
            )));
        }

        let mut dist: HashMap<String, u32> = HashMap::new();
        let mut prev: HashMap<String, String> = HashMap::new();
        let mut heap = BinaryHeap::new();

        dist.insert(LOCAL.to_string(), 0);
        heap.push(DijkstraState {
            cost: 0,
            order: 0,
            node: LOCAL.to_string(),
        });

        while let Some(DijkstraState { cost, node, .. }) = heap.pop() {
            if node == target_id {
                break;
            }
            if cost > *dist.get(&node).unwrap_or(&u32::MAX) {
                continue;
            }
            let Some(neighbors) = self.edges.get(&node) else {
                continue;
            };
            for next in neighbors {
                let next_cost = cost + 1;
                // strict improvement only: the first equal-cost settler wins,
                // and settle order follows endpoint insertion order
                if next_cost < *dist.get(next).unwrap_or(&u32::MAX) {
                    dist.insert(next.clone(), next_cost);
                    prev.insert(next.clone(), node.clone());
                    heap.push(DijkstraState {
                        cost: next_cost,
                        order: *self.order.get(next).unwrap_or(&usize::MAX),
                        node: next.clone(),
                    });
                }
            }
        }

        if !prev.contains_key(target_id) {
            return Err(CoreError::NoRouteFound(target_id.to_string()));
        }

        let mut path = vec![target_id.to_string()];
        let mut current = target_id.to_string();
        while let Some(p) = prev.get(&current) {
            if p == LOCAL {
                break;
            }
            path.push(p.clone());
            current = p.clone();
        }
        path.reverse();
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::AuthSpec;

    fn saved(id: &str, chain: &[&str]) -> SavedEndpoint {
        SavedEndpoint {
            id: id.to_string(),
            endpoint: EndpointSpec {
                host: format!("{}.example.com", id),
                port: 22,
                username: "u".to_string(),
                auth: AuthSpec::Agent,
                label: None,
            },
            proxy_chain: chain.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_chain_path_a_b_c() {
        let graph = TopologyGraph::build(&[saved("a", &[]), saved("b", &["a"]), saved("c", &["a", "b"])]);
        assert_eq!(graph.compute_route("c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(graph.compute_route("b").unwrap(), vec!["a", "b"]);
        assert_eq!(graph.compute_route("a").unwrap(), vec!["a"]);
    }

    #[test]
    fn test_unreachable_target_is_no_route() {
        // d's only chain names an endpoint nobody saved
        let graph = TopologyGraph::build(&[saved("a", &[]), saved("d", &["ghost"])]);
        let err = graph.compute_route("d").unwrap_err();
        assert!(matches!(err, CoreError::NoRouteFound(_)));
    }

    #[test]
    fn test_unknown_target_is_not_found() {
        let graph = TopologyGraph::build(&[saved("a", &[])]);
        assert!(matches!(
            graph.compute_route("zz"),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_equal_cost_tie_prefers_earlier_saved_endpoint() {
        // t is reachable through j1 (its own chain) and through j2 (declared
        // by u's chain), both at two hops; j1 was saved first and wins
        let endpoints = [
            saved("j1", &[]),
            saved("j2", &[]),
            saved("t", &["j1"]),
            saved("u", &["j2", "t"]),
        ];
        let graph = TopologyGraph::build(&endpoints);
        assert_eq!(graph.compute_route("t").unwrap(), vec!["j1", "t"]);

        // flip the declaration order and the other jump wins
        let endpoints = [
            saved("j2", &[]),
            saved("j1", &[]),
            saved("u", &["j2", "t"]),
            saved("t", &["j1"]),
        ];
        let graph = TopologyGraph::build(&endpoints);
        assert_eq!(graph.compute_route("t").unwrap(), vec!["j2", "t"]);
    }

    #[test]
    fn test_shorter_declared_route_wins() {
        // b's own chain goes through a, but c's chain declares b as its
        // direct first hop, which makes local->b->c the two-hop winner
        let endpoints = [saved("a", &[]), saved("b", &["a"]), saved("c", &["b"])];
        let graph = TopologyGraph::build(&endpoints);
        assert_eq!(graph.compute_route("c").unwrap(), vec!["b", "c"]);
    }
}
