// 🚩 Classifier - bogus detection and contamination propagation
//
// Pass 1 flags entities whose purchase/sales ratio leaves the normal band.
// Pass 2 walks the graph root-to-leaf (topological order) and pushes the
// bogus share of each entity's sales down to its buyers.
//
// Apportionment across several bogus ancestors is additive: every parent
// contributes inflow × taint, and the sum is divided by the larger of the
// buyer's own purchases and its total traced inflow, so it never exceeds 100%.

use crate::error::{AnalysisError, AnalysisResult};
use crate::graph::{EntityGraph, EntityNode, Ratio, Status};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;

const ONE_HUNDRED: Decimal = Decimal::ONE_HUNDRED;

// ============================================================================
// THRESHOLD BAND
// ============================================================================

/// Normal purchase/sales band, inclusive on both edges.
///
/// Built from the single `bogus_threshold` knob t ∈ (0, 1) as
/// `low = 1 - t`, `high = 1 / (1 - t)`, so t = 0.5 gives [0.5, 2.0] and
/// t = 0.4 gives [0.6, 1.667].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdBand {
    pub low: Decimal,
    pub high: Decimal,
}

impl ThresholdBand {
    pub fn from_threshold(threshold: f64) -> AnalysisResult<ThresholdBand> {
        if !threshold.is_finite() || threshold <= 0.0 || threshold >= 1.0 {
            return Err(AnalysisError::Configuration(format!(
                "bogus_threshold must be strictly between 0 and 1, got {}",
                threshold
            )));
        }
        // Shortest decimal form of the float, so 0.4 stays exactly 0.4
        let t = Decimal::from_str(&threshold.to_string()).map_err(|_| {
            AnalysisError::Configuration(format!("bogus_threshold {} is not representable", threshold))
        })?;
        let low = Decimal::ONE - t;
        Ok(ThresholdBand {
            low,
            high: Decimal::ONE / low,
        })
    }

    /// True when the ratio falls outside [low, high] or is the infinite sentinel
    pub fn is_outside(&self, ratio: &Ratio) -> bool {
        match ratio {
            Ratio::Infinite => true,
            Ratio::Finite(r) => *r < self.low || *r > self.high,
        }
    }
}

impl Default for ThresholdBand {
    fn default() -> Self {
        ThresholdBand {
            low: Decimal::new(5, 1),
            high: Decimal::TWO,
        }
    }
}

// ============================================================================
// RISK SCORE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub purchase_sales_ratio: f64,
    pub contamination: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        RiskWeights {
            purchase_sales_ratio: 0.6,
            contamination: 0.4,
        }
    }
}

impl RiskWeights {
    pub fn validate(&self) -> AnalysisResult<()> {
        let valid = |w: f64| w.is_finite() && w >= 0.0;
        if !valid(self.purchase_sales_ratio) || !valid(self.contamination) {
            return Err(AnalysisError::Configuration(
                "risk weights must be finite and non-negative".into(),
            ));
        }
        if self.purchase_sales_ratio + self.contamination == 0.0 {
            return Err(AnalysisError::Configuration("risk weights sum to zero".into()));
        }
        Ok(())
    }
}

/// Distance of the ratio from 1.0 mapped to [0, 100]
fn ratio_component(node: &EntityNode) -> f64 {
    if !node.has_activity() {
        return 0.0;
    }
    match node.purchase_to_sales_ratio {
        Ratio::Infinite => 100.0,
        Ratio::Finite(r) => {
            let r = r.to_f64().unwrap_or(f64::INFINITY);
            let distance = if r < 1.0 { 1.0 - r } else { 1.0 - 1.0 / r };
            distance.clamp(0.0, 1.0) * 100.0
        }
    }
}

/// Pure, deterministic risk score in [0, 100]
pub fn risk_score(node: &EntityNode, weights: &RiskWeights) -> f64 {
    let contamination = node.contamination_level.to_f64().unwrap_or(0.0);
    let score = weights.purchase_sales_ratio * ratio_component(node) + weights.contamination * contamination;
    (score.min(100.0) * 100.0).round() / 100.0
}

/// Status precedence: MISSING > BOGUS > CONTAMINATED > OK
pub fn status_of(node: &EntityNode) -> Status {
    if !node.data_available {
        Status::Missing
    } else if node.is_bogus {
        Status::Bogus
    } else if node.is_contaminated {
        Status::Contaminated
    } else {
        Status::Ok
    }
}

// ============================================================================
// CLASSIFIER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassificationSummary {
    pub ok: usize,
    pub bogus: usize,
    pub contaminated: usize,
    pub missing: usize,
}

pub struct Classifier {
    pub band: ThresholdBand,
    pub weights: RiskWeights,
}

impl Classifier {
    pub fn new(band: ThresholdBand, weights: RiskWeights) -> Self {
        Classifier { band, weights }
    }

    /// Classify every node in place.
    ///
    /// Fails with `CyclicGraph` before touching any node when the graph is
    /// not a DAG.
    pub fn classify(&self, graph: &mut EntityGraph) -> AnalysisResult<ClassificationSummary> {
        graph.verify_symmetry()?;
        let order = graph.topological_order()?;

        // Pass 1: local bogus determination
        for node in graph.nodes_mut() {
            node.is_bogus =
                node.data_available && node.has_activity() && self.band.is_outside(&node.purchase_to_sales_ratio);
        }

        // Pass 2: contamination, parents before children
        let mut taint = vec![Decimal::ZERO; graph.len()];
        let mut bogus_upstream = vec![false; graph.len()];

        for &idx in &order {
            let node = graph.node_at(idx);
            let mut tainted_inflow = Decimal::ZERO;
            let mut total_inflow = Decimal::ZERO;
            let mut has_bogus_ancestor = false;

            for parent_id in &node.parent_ids {
                let Some(p) = graph.position(parent_id) else {
                    continue;
                };
                let parent = graph.node_at(p);
                let inflow = inflow_between(parent, node);
                if inflow <= Decimal::ZERO {
                    continue;
                }
                has_bogus_ancestor |= parent.is_bogus || bogus_upstream[p];

                // taint is at most 1, so only the running sums can saturate
                total_inflow = total_inflow.saturating_add(inflow);
                tainted_inflow = tainted_inflow.saturating_add(inflow.saturating_mul(taint[p]));
            }

            let denominator = node.total_purchases.max(total_inflow);
            let fraction = if denominator > Decimal::ZERO {
                (tainted_inflow / denominator).min(Decimal::ONE)
            } else {
                Decimal::ZERO
            };

            bogus_upstream[idx] = has_bogus_ancestor;
            taint[idx] = if node.is_bogus { Decimal::ONE } else { fraction };

            let node = graph.node_at_mut(idx);
            node.is_contaminated = !node.is_bogus && has_bogus_ancestor;
            node.contamination_level = fraction * ONE_HUNDRED;
            node.bogus_value = fraction * node.total_purchases;
        }

        // Risk and status
        let mut summary = ClassificationSummary::default();
        for node in graph.nodes_mut() {
            node.risk_score = risk_score(node, &self.weights);
            node.status = status_of(node);
            match node.status {
                Status::Ok => summary.ok += 1,
                Status::Bogus => summary.bogus += 1,
                Status::Contaminated => summary.contaminated += 1,
                Status::Missing => summary.missing += 1,
            }
        }

        info!(
            ok = summary.ok,
            bogus = summary.bogus,
            contaminated = summary.contaminated,
            missing = summary.missing,
            "classification complete"
        );
        Ok(summary)
    }
}

/// Amount of `child`'s purchases traced to `parent`.
///
/// The buyer's own purchase records win; when the buyer's file says nothing
/// about this supplier, the seller's recorded sales to the buyer are used.
fn inflow_between(parent: &EntityNode, child: &EntityNode) -> Decimal {
    match child.purchases_by_supplier.get(&parent.id) {
        Some(amount) if *amount > Decimal::ZERO => *amount,
        _ => parent
            .sales_by_buyer
            .get(&child.id)
            .copied()
            .unwrap_or(Decimal::ZERO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EntityNode;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn entity(id: &str, sales: &str, purchases: &str) -> EntityNode {
        let mut node = EntityNode::new(id, true);
        node.total_sales = dec(sales);
        node.total_purchases = dec(purchases);
        node.purchase_to_sales_ratio = Ratio::compute(node.total_purchases, node.total_sales);
        node
    }

    /// Record that `seller` sold `amount` to `buyer` in both files
    fn trade(graph: &mut EntityGraph, seller: &str, buyer: &str, amount: &str) {
        graph.link(seller, buyer);
        graph
            .get_mut(seller)
            .unwrap()
            .sales_by_buyer
            .insert(buyer.to_string(), dec(amount));
        graph
            .get_mut(buyer)
            .unwrap()
            .purchases_by_supplier
            .insert(seller.to_string(), dec(amount));
    }

    fn classifier() -> Classifier {
        Classifier::new(ThresholdBand::default(), RiskWeights::default())
    }

    fn single(sales: &str, purchases: &str) -> EntityNode {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("AAAAA1111A", sales, purchases));
        classifier().classify(&mut graph).unwrap();
        graph.get("AAAAA1111A").unwrap().clone()
    }

    #[test]
    fn test_band_from_threshold() {
        let band = ThresholdBand::from_threshold(0.5).unwrap();
        assert_eq!(band, ThresholdBand::default());

        let band = ThresholdBand::from_threshold(0.4).unwrap();
        assert_eq!(band.low, dec("0.6"));
        assert_eq!(band.high.round_dp(2), dec("1.67"));

        assert!(ThresholdBand::from_threshold(1.0).is_err());
        assert!(ThresholdBand::from_threshold(0.0).is_err());
    }

    #[test]
    fn test_threshold_boundaries_inclusive() {
        assert_eq!(single("100", "50").status, Status::Ok); // 0.5
        assert_eq!(single("100", "200").status, Status::Ok); // 2.0
        assert_eq!(single("100", "49").status, Status::Bogus); // 0.49
        assert_eq!(single("100", "201").status, Status::Bogus); // 2.01
    }

    #[test]
    fn test_ratio_sentinel_is_bogus() {
        let node = single("0", "500");
        assert!(node.purchase_to_sales_ratio.is_infinite());
        assert!(node.is_bogus);
        assert_eq!(node.risk_score, 60.0);
    }

    #[test]
    fn test_zero_zero_not_bogus() {
        let node = single("0", "0");
        assert_eq!(node.purchase_to_sales_ratio, Ratio::Finite(Decimal::ZERO));
        assert!(!node.is_bogus);
        assert_eq!(node.status, Status::Ok);
        assert_eq!(node.risk_score, 0.0);
    }

    #[test]
    fn test_propagation_and_sibling_stays_clean() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("R", "1000", "900"));
        graph.add_node(entity("A", "100", "1000")); // ratio 10 → bogus
        graph.add_node(entity("C", "1000", "800"));
        graph.add_node(entity("B", "1000", "800"));
        trade(&mut graph, "R", "A", "1000");
        trade(&mut graph, "R", "C", "800");
        trade(&mut graph, "A", "B", "100");

        classifier().classify(&mut graph).unwrap();

        let a = graph.get("A").unwrap();
        let b = graph.get("B").unwrap();
        let c = graph.get("C").unwrap();
        assert!(a.is_bogus);
        assert!(!b.is_bogus);
        assert!(b.is_contaminated);
        assert!(b.contamination_level > Decimal::ZERO);
        assert_eq!(b.contamination_level, dec("12.5")); // 100 of 800
        assert_eq!(b.bogus_value, dec("100"));
        assert_eq!(b.status, Status::Contaminated);
        assert!(!c.is_contaminated);
        assert_eq!(c.contamination_level, Decimal::ZERO);
        assert_eq!(c.status, Status::Ok);
    }

    #[test]
    fn test_end_to_end_example() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("R", "2000000", "1800000"));
        graph.add_node(entity("A", "1000000", "600000"));
        graph.add_node(entity("B", "200000", "50000000"));
        graph.add_node(entity("C", "1200000", "1000000"));
        trade(&mut graph, "R", "A", "600000");
        trade(&mut graph, "R", "B", "1400000");
        trade(&mut graph, "B", "C", "400000");

        let summary = classifier().classify(&mut graph).unwrap();

        let a = graph.get("A").unwrap();
        assert_eq!(a.purchase_to_sales_ratio, Ratio::Finite(dec("0.6")));
        assert_eq!(a.status, Status::Ok);
        assert!(!a.is_contaminated);

        let b = graph.get("B").unwrap();
        assert_eq!(b.purchase_to_sales_ratio, Ratio::Finite(dec("250")));
        assert_eq!(b.status, Status::Bogus);

        let c = graph.get("C").unwrap();
        assert!(c.is_contaminated);
        assert_eq!(c.contamination_level, dec("40"));
        assert_eq!(c.bogus_value, dec("400000"));

        assert_eq!(summary.bogus, 1);
        assert_eq!(summary.contaminated, 1);
        assert_eq!(summary.ok, 2);
    }

    #[test]
    fn test_multi_ancestor_additive() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("R", "1000", "1000"));
        graph.add_node(entity("B1", "10", "1000"));
        graph.add_node(entity("B2", "10", "1000"));
        graph.add_node(entity("O", "1000", "1000"));
        graph.add_node(entity("D", "1000", "1000"));
        trade(&mut graph, "R", "B1", "300");
        trade(&mut graph, "R", "B2", "300");
        trade(&mut graph, "R", "O", "300");
        trade(&mut graph, "B1", "D", "300");
        trade(&mut graph, "B2", "D", "200");
        trade(&mut graph, "O", "D", "500");

        classifier().classify(&mut graph).unwrap();
        let d = graph.get("D").unwrap();
        assert!(d.is_contaminated);
        assert_eq!(d.contamination_level, dec("50"));
        assert_eq!(d.bogus_value, dec("500"));
    }

    #[test]
    fn test_multi_ancestor_capped_at_hundred() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("B1", "10", "1000"));
        graph.add_node(entity("B2", "10", "1000"));
        graph.add_node(entity("D", "1000", "1000"));
        trade(&mut graph, "B1", "D", "800");
        trade(&mut graph, "B2", "D", "800");

        classifier().classify(&mut graph).unwrap();
        let d = graph.get("D").unwrap();
        assert_eq!(d.contamination_level, dec("100"));
        assert_eq!(d.bogus_value, dec("1000"));
    }

    #[test]
    fn test_contamination_decays_down_the_chain() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("B", "10", "1000"));
        graph.add_node(entity("C", "1000", "1000"));
        graph.add_node(entity("E", "1000", "1000"));
        trade(&mut graph, "B", "C", "400");
        trade(&mut graph, "C", "E", "500");

        classifier().classify(&mut graph).unwrap();
        assert_eq!(graph.get("C").unwrap().contamination_level, dec("40"));
        assert_eq!(graph.get("E").unwrap().contamination_level, dec("20"));
        assert!(graph.get("E").unwrap().is_contaminated);
    }

    #[test]
    fn test_seller_side_inflow_when_buyer_silent() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("B", "10", "1000"));
        graph.add_node(entity("C", "1000", "1000"));
        graph.link("B", "C");
        graph
            .get_mut("B")
            .unwrap()
            .sales_by_buyer
            .insert("C".into(), dec("250"));

        classifier().classify(&mut graph).unwrap();
        assert_eq!(graph.get("C").unwrap().contamination_level, dec("25"));
    }

    #[test]
    fn test_missing_takes_precedence() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("B", "10", "1000"));
        graph.add_node(EntityNode::new("X123456789", false));
        trade(&mut graph, "B", "X123456789", "50");

        classifier().classify(&mut graph).unwrap();
        let x = graph.get("X123456789").unwrap();
        assert!(!x.is_bogus);
        assert!(x.is_contaminated);
        assert_eq!(x.status, Status::Missing);
        assert_eq!(x.total_purchases, Decimal::ZERO);
        assert_eq!(x.bogus_value, Decimal::ZERO);
    }

    #[test]
    fn test_cycle_is_fatal_and_leaves_nodes_untouched() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("A", "0", "500"));
        graph.add_node(entity("B", "100", "100"));
        graph.link("A", "B");
        graph.link("B", "A");

        let err = classifier().classify(&mut graph).unwrap_err();
        assert!(matches!(err, AnalysisError::CyclicGraph { .. }));
        assert!(!graph.get("A").unwrap().is_bogus);
    }

    #[test]
    fn test_asymmetric_links_rejected_before_ordering() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("R", "1000", "1000"));
        graph.add_node(entity("A", "1000", "1000"));
        graph.get_mut("R").unwrap().children_ids.push("A".to_string());

        let err = classifier().classify(&mut graph).unwrap_err();
        assert!(matches!(err, AnalysisError::LinkAsymmetry { .. }));
        assert_eq!(graph.get("A").unwrap().status, Status::Ok);
    }

    #[test]
    fn test_zero_inflow_edge_does_not_contaminate() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("B", "10", "1000"));
        graph.add_node(entity("C", "1000", "1000"));
        trade(&mut graph, "B", "C", "0");

        classifier().classify(&mut graph).unwrap();
        let c = graph.get("C").unwrap();
        assert!(graph.get("B").unwrap().is_bogus);
        assert!(!c.is_contaminated);
        assert_eq!(c.contamination_level, Decimal::ZERO);
        assert_eq!(c.status, Status::Ok);
    }

    #[test]
    fn test_huge_inflows_saturate_instead_of_panicking() {
        let mut graph = EntityGraph::new();
        graph.add_node(entity("B1", "1", &Decimal::MAX.to_string()));
        graph.add_node(entity("B2", "1", &Decimal::MAX.to_string()));
        graph.add_node(entity("D", "1000", "1000"));
        trade(&mut graph, "B1", "D", &Decimal::MAX.to_string());
        trade(&mut graph, "B2", "D", &Decimal::MAX.to_string());

        classifier().classify(&mut graph).unwrap();
        let d = graph.get("D").unwrap();
        assert!(d.is_contaminated);
        assert_eq!(d.contamination_level, dec("100"));
    }

    #[test]
    fn test_risk_score_monotonic_and_deterministic() {
        let weights = RiskWeights::default();
        let near = entity("A", "100", "90");
        let far = entity("B", "100", "20");
        let farther = entity("C", "100", "5");
        let high = entity("D", "100", "400");

        assert!(risk_score(&near, &weights) < risk_score(&far, &weights));
        assert!(risk_score(&far, &weights) < risk_score(&farther, &weights));
        assert_eq!(risk_score(&high, &weights), 45.0); // 0.6 × 75
        assert_eq!(risk_score(&far, &weights), risk_score(&far.clone(), &weights));

        let mut contaminated = near.clone();
        contaminated.contamination_level = dec("50");
        assert!(risk_score(&contaminated, &weights) > risk_score(&near, &weights));
    }
}
