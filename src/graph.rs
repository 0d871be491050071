// 🕸️ Entity Graph - arena of entity nodes keyed by PAN
//
// Nodes live in a Vec in discovery order; the index map gives O(1) lookup.
// Adjacency is kept as ordered id lists and only joined into strings when a
// snapshot is exported.

use crate::error::{AnalysisError, AnalysisResult};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

// ============================================================================
// RATIO & STATUS
// ============================================================================

/// Purchase-to-sales ratio with an explicit sentinel for "purchases, no sales"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ratio {
    Finite(Decimal),
    Infinite,
}

impl Ratio {
    pub fn compute(purchases: Decimal, sales: Decimal) -> Ratio {
        if sales > Decimal::ZERO {
            // Decimal division only fails on overflow; fall back to the sentinel
            purchases
                .checked_div(sales)
                .map(Ratio::Finite)
                .unwrap_or(Ratio::Infinite)
        } else if purchases > Decimal::ZERO {
            Ratio::Infinite
        } else {
            Ratio::Finite(Decimal::ZERO)
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Ratio::Infinite)
    }

    /// Finite value, None for the sentinel
    pub fn value(&self) -> Option<Decimal> {
        match self {
            Ratio::Finite(v) => Some(*v),
            Ratio::Infinite => None,
        }
    }

    pub fn to_f64(&self) -> f64 {
        match self {
            Ratio::Finite(v) => v.to_f64().unwrap_or(f64::INFINITY),
            Ratio::Infinite => f64::INFINITY,
        }
    }
}

impl Default for Ratio {
    fn default() -> Self {
        Ratio::Finite(Decimal::ZERO)
    }
}

/// Status label, in precedence order MISSING > BOGUS > CONTAMINATED > OK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Missing,
    Bogus,
    Contaminated,
    Ok,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Missing => "MISSING",
            Status::Bogus => "BOGUS",
            Status::Contaminated => "CONTAMINATED",
            Status::Ok => "OK",
        }
    }

    pub fn parse(value: &str) -> Option<Status> {
        match value.trim().to_uppercase().as_str() {
            "MISSING" => Some(Status::Missing),
            "BOGUS" => Some(Status::Bogus),
            "CONTAMINATED" => Some(Status::Contaminated),
            "OK" => Some(Status::Ok),
            _ => None,
        }
    }
}

// ============================================================================
// ENTITY NODE
// ============================================================================

/// One sale as seen from the seller's file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleDetail {
    pub buyer_pan: String,
    pub buyer_name: String,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub amount: Decimal,
    pub taxpayer_type: String,
    pub business_nature: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityNode {
    pub id: String,
    pub entity_name: String,
    pub data_available: bool,

    // Aggregates
    pub total_sales: Decimal,
    pub total_purchases: Decimal,
    pub transaction_count: u64,
    pub avg_transaction_size: Decimal,
    pub purchase_to_sales_ratio: Ratio,

    // Classification
    pub is_bogus: bool,
    pub is_contaminated: bool,
    pub contamination_level: Decimal,
    pub bogus_value: Decimal,
    pub risk_score: f64,
    pub status: Status,

    // Links, ordered by first sighting
    pub children_ids: Vec<String>,
    pub parent_ids: Vec<String>,

    /// Purchases recorded in this entity's own file, per supplier
    pub purchases_by_supplier: BTreeMap<String, Decimal>,
    /// Sales recorded in this entity's own file, per buyer
    pub sales_by_buyer: BTreeMap<String, Decimal>,
    pub sales_records: Vec<SaleDetail>,
}

impl EntityNode {
    pub fn new(id: &str, data_available: bool) -> Self {
        EntityNode {
            id: id.to_string(),
            entity_name: id.to_string(),
            data_available,
            total_sales: Decimal::ZERO,
            total_purchases: Decimal::ZERO,
            transaction_count: 0,
            avg_transaction_size: Decimal::ZERO,
            purchase_to_sales_ratio: Ratio::default(),
            is_bogus: false,
            is_contaminated: false,
            contamination_level: Decimal::ZERO,
            bogus_value: Decimal::ZERO,
            risk_score: 0.0,
            status: if data_available { Status::Ok } else { Status::Missing },
            children_ids: Vec::new(),
            parent_ids: Vec::new(),
            purchases_by_supplier: BTreeMap::new(),
            sales_by_buyer: BTreeMap::new(),
            sales_records: Vec::new(),
        }
    }

    /// Any sales or purchases at all
    pub fn has_activity(&self) -> bool {
        self.total_sales > Decimal::ZERO || self.total_purchases > Decimal::ZERO
    }
}

// ============================================================================
// ENTITY GRAPH
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct EntityGraph {
    nodes: Vec<EntityNode>,
    index: HashMap<String, usize>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Insert a node; an existing id keeps its original position and data
    pub fn add_node(&mut self, node: EntityNode) -> usize {
        if let Some(&idx) = self.index.get(&node.id) {
            return idx;
        }
        let idx = self.nodes.len();
        self.index.insert(node.id.clone(), idx);
        self.nodes.push(node);
        idx
    }

    pub fn get(&self, id: &str) -> Option<&EntityNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut EntityNode> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.nodes[i]),
            None => None,
        }
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node_at(&self, idx: usize) -> &EntityNode {
        &self.nodes[idx]
    }

    pub fn node_at_mut(&mut self, idx: usize) -> &mut EntityNode {
        &mut self.nodes[idx]
    }

    /// Nodes in discovery order
    pub fn nodes(&self) -> impl Iterator<Item = &EntityNode> {
        self.nodes.iter()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut EntityNode> {
        self.nodes.iter_mut()
    }

    /// Add a parent → child edge on both ends. Both nodes must exist.
    pub fn link(&mut self, parent: &str, child: &str) -> bool {
        let (Some(&p), Some(&c)) = (self.index.get(parent), self.index.get(child)) else {
            return false;
        };
        if !self.nodes[p].children_ids.iter().any(|id| id == child) {
            self.nodes[p].children_ids.push(child.to_string());
        }
        if !self.nodes[c].parent_ids.iter().any(|id| id == parent) {
            self.nodes[c].parent_ids.push(parent.to_string());
        }
        true
    }

    /// True when `target` can be reached from `from` by following child links
    pub fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from];
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.get(id) {
                stack.extend(node.children_ids.iter().map(String::as_str));
            }
        }
        false
    }

    /// Every child lists its parent and every parent lists its child
    pub fn verify_symmetry(&self) -> AnalysisResult<()> {
        for node in &self.nodes {
            for child in &node.children_ids {
                let ok = self
                    .get(child)
                    .map(|c| c.parent_ids.contains(&node.id))
                    .unwrap_or(false);
                if !ok {
                    return Err(AnalysisError::LinkAsymmetry {
                        parent: node.id.clone(),
                        child: child.clone(),
                    });
                }
            }
            for parent in &node.parent_ids {
                let ok = self
                    .get(parent)
                    .map(|p| p.children_ids.contains(&node.id))
                    .unwrap_or(false);
                if !ok {
                    return Err(AnalysisError::LinkAsymmetry {
                        parent: parent.clone(),
                        child: node.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Parents-before-children order (Kahn), ties broken by discovery order.
    ///
    /// Fails with `CyclicGraph` naming one offending cycle.
    pub fn topological_order(&self) -> AnalysisResult<Vec<usize>> {
        // Counted and released from the same side so a one-sided link cannot underflow
        let mut indegree = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            for child in &node.children_ids {
                if let Some(c) = self.position(child) {
                    indegree[c] += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for child in &self.nodes[idx].children_ids {
                if let Some(c) = self.position(child) {
                    indegree[c] -= 1;
                    if indegree[c] == 0 {
                        ready.push(Reverse(c));
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let blocked: HashSet<usize> = indegree
                .iter()
                .enumerate()
                .filter(|(_, &d)| d > 0)
                .map(|(i, _)| i)
                .collect();
            Err(AnalysisError::CyclicGraph {
                cycle: self.find_cycle(&blocked),
            })
        }
    }

    /// Walk parent links inside the blocked set until a node repeats
    fn find_cycle(&self, blocked: &HashSet<usize>) -> Vec<String> {
        let Some(&start) = blocked.iter().min() else {
            return Vec::new();
        };

        // Every blocked node has a blocked parent, so this walk must repeat
        let mut path: Vec<usize> = vec![start];
        let mut seen_at: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let next = self.nodes[current]
                .parent_ids
                .iter()
                .filter_map(|p| self.position(p))
                .find(|p| blocked.contains(p));
            let Some(next) = next else {
                return path.iter().map(|&i| self.nodes[i].id.clone()).collect();
            };
            if let Some(&at) = seen_at.get(&next) {
                // Parent walk runs against edge direction; reverse to read root-to-leaf
                let mut cycle: Vec<String> = path[at..]
                    .iter()
                    .rev()
                    .map(|&i| self.nodes[i].id.clone())
                    .collect();
                cycle.insert(0, self.nodes[next].id.clone());
                return cycle;
            }
            seen_at.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }

    /// All ancestors of a node (nearest first, each once)
    pub fn ancestors(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: std::collections::VecDeque<String> = self
            .get(id)
            .map(|n| n.parent_ids.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(pid) = queue.pop_front() {
            if pid == id || !seen.insert(pid.clone()) {
                continue;
            }
            if let Some(parent) = self.get(&pid) {
                queue.extend(parent.parent_ids.iter().cloned());
            }
            out.push(pid);
        }
        out
    }

    /// Nodes without parents
    pub fn roots(&self) -> Vec<&EntityNode> {
        self.nodes.iter().filter(|n| n.parent_ids.is_empty()).collect()
    }

    /// Case-insensitive substring match on PAN or entity name
    pub fn search<'a>(&'a self, query: &str) -> Vec<&'a EntityNode> {
        let q = query.trim().to_uppercase();
        if q.is_empty() {
            return Vec::new();
        }
        self.nodes
            .iter()
            .filter(|n| n.id.contains(&q) || n.entity_name.to_uppercase().contains(&q))
            .collect()
    }

    pub fn filter_by_status(&self, status: Status) -> Vec<&EntityNode> {
        self.nodes.iter().filter(|n| n.status == status).collect()
    }

    /// Nodes visible in a tree view rooted at `root`, given the expanded set.
    ///
    /// Pre-order, lazy; a node shows up once even when several expanded
    /// parents lead to it.
    pub fn visible_nodes<'a>(
        &'a self,
        root: &str,
        expanded: &'a HashSet<String>,
    ) -> VisibleNodes<'a> {
        VisibleNodes {
            graph: self,
            expanded,
            stack: self.position(root).map(|i| vec![(i, 0)]).unwrap_or_default(),
            visited: HashSet::new(),
        }
    }
}

/// One row of an expand/collapse tree view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisibleNode {
    pub id: String,
    pub depth: usize,
    pub has_children: bool,
    pub expanded: bool,
}

pub struct VisibleNodes<'a> {
    graph: &'a EntityGraph,
    expanded: &'a HashSet<String>,
    stack: Vec<(usize, usize)>,
    visited: HashSet<usize>,
}

impl<'a> Iterator for VisibleNodes<'a> {
    type Item = VisibleNode;

    fn next(&mut self) -> Option<VisibleNode> {
        while let Some((idx, depth)) = self.stack.pop() {
            if !self.visited.insert(idx) {
                continue;
            }
            let node = self.graph.node_at(idx);
            let expanded = self.expanded.contains(&node.id);

            if expanded {
                // Reverse push keeps children in their listed order
                for child in node.children_ids.iter().rev() {
                    if let Some(c) = self.graph.position(child) {
                        if !self.visited.contains(&c) {
                            self.stack.push((c, depth + 1));
                        }
                    }
                }
            }

            return Some(VisibleNode {
                id: node.id.clone(),
                depth,
                has_children: !node.children_ids.is_empty(),
                expanded,
            });
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Graph with data-available nodes and the given edges, in listed order
    pub(crate) fn graph_of(ids: &[&str], edges: &[(&str, &str)]) -> EntityGraph {
        let mut graph = EntityGraph::new();
        for id in ids {
            graph.add_node(EntityNode::new(id, true));
        }
        for (p, c) in edges {
            assert!(graph.link(p, c));
        }
        graph
    }

    #[test]
    fn test_ratio_sentinels() {
        let d = |s: &str| s.parse::<Decimal>().unwrap();
        assert_eq!(Ratio::compute(d("500"), Decimal::ZERO), Ratio::Infinite);
        assert_eq!(Ratio::compute(Decimal::ZERO, Decimal::ZERO), Ratio::Finite(Decimal::ZERO));
        assert_eq!(Ratio::compute(d("600000"), d("1000000")), Ratio::Finite(d("0.6")));
    }

    #[test]
    fn test_link_is_symmetric_and_idempotent() {
        let mut graph = graph_of(&["R", "A"], &[("R", "A")]);
        graph.link("R", "A");
        assert_eq!(graph.get("R").unwrap().children_ids, vec!["A"]);
        assert_eq!(graph.get("A").unwrap().parent_ids, vec!["R"]);
        assert!(graph.verify_symmetry().is_ok());
        assert!(!graph.link("R", "NOPE"));
    }

    #[test]
    fn test_asymmetry_detected() {
        let mut graph = graph_of(&["R", "A"], &[]);
        graph.get_mut("R").unwrap().children_ids.push("A".into());
        assert!(matches!(
            graph.verify_symmetry(),
            Err(AnalysisError::LinkAsymmetry { .. })
        ));
    }

    #[test]
    fn test_topological_order_parents_first() {
        // Discovery order puts C before B, but C depends on B
        let graph = graph_of(&["R", "C", "B"], &[("R", "B"), ("B", "C"), ("R", "C")]);
        let order: Vec<&str> = graph
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|i| graph.node_at(i).id.as_str())
            .collect();
        assert_eq!(order, vec!["R", "B", "C"]);
    }

    #[test]
    fn test_topological_order_tolerates_one_sided_link() {
        let mut graph = graph_of(&["R", "A"], &[]);
        graph.get_mut("R").unwrap().children_ids.push("A".into());
        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn test_cycle_detected_with_ids() {
        let graph = graph_of(&["R", "A", "B"], &[("R", "A"), ("A", "B"), ("B", "A")]);
        match graph.topological_order() {
            Err(AnalysisError::CyclicGraph { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"A".to_string()));
                assert!(cycle.contains(&"B".to_string()));
                assert!(!cycle.contains(&"R".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let graph = graph_of(&["A"], &[("A", "A")]);
        assert!(matches!(
            graph.topological_order(),
            Err(AnalysisError::CyclicGraph { .. })
        ));
    }

    #[test]
    fn test_visible_nodes_respects_expanded_set() {
        let graph = graph_of(
            &["R", "A", "B", "C", "D"],
            &[("R", "A"), ("R", "B"), ("A", "C"), ("B", "D")],
        );

        let collapsed = HashSet::new();
        let rows: Vec<_> = graph.visible_nodes("R", &collapsed).collect();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].has_children);
        assert!(!rows[0].expanded);

        let expanded: HashSet<String> = ["R", "A"].iter().map(|s| s.to_string()).collect();
        let rows: Vec<(String, usize)> = graph
            .visible_nodes("R", &expanded)
            .map(|v| (v.id, v.depth))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("R".to_string(), 0),
                ("A".to_string(), 1),
                ("C".to_string(), 2),
                ("B".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_visible_nodes_shared_child_once_and_cycle_safe() {
        let graph = graph_of(&["R", "A", "B", "S"], &[("R", "A"), ("R", "B"), ("A", "S"), ("B", "S"), ("S", "R")]);
        let all: HashSet<String> = ["R", "A", "B", "S"].iter().map(|s| s.to_string()).collect();
        let ids: Vec<String> = graph.visible_nodes("R", &all).map(|v| v.id).collect();
        assert_eq!(ids, vec!["R", "A", "S", "B"]);
        assert!(graph.visible_nodes("UNKNOWN", &all).next().is_none());
    }

    #[test]
    fn test_search_roots_ancestors() {
        let mut graph = graph_of(&["AAAAA1111A", "BBBBB2222B", "CCCCC3333C"], &[
            ("AAAAA1111A", "BBBBB2222B"),
            ("BBBBB2222B", "CCCCC3333C"),
        ]);
        graph.get_mut("CCCCC3333C").unwrap().entity_name = "Shell Traders".into();

        assert_eq!(graph.search("bbbbb").len(), 1);
        assert_eq!(graph.search("shell")[0].id, "CCCCC3333C");
        assert!(graph.search("  ").is_empty());
        assert_eq!(graph.roots().len(), 1);
        assert_eq!(graph.ancestors("CCCCC3333C"), vec!["BBBBB2222B", "AAAAA1111A"]);
        assert!(graph.reaches("AAAAA1111A", "CCCCC3333C"));
        assert!(!graph.reaches("CCCCC3333C", "AAAAA1111A"));
    }
}
