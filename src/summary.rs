// 📊 Summary - dashboard aggregates over a published snapshot
//
// Everything here reads a GraphSnapshot only, so the server and the CLI
// report the same numbers for the same output directory.

use crate::exporter::{GraphSnapshot, NodeRecord};
use crate::graph::SaleDetail;
use rust_decimal::Decimal;
use serde::Serialize;

/// Contamination level above which an entity is listed as high contamination
pub const HIGH_CONTAMINATION_LEVEL: Decimal = Decimal::from_parts(50, 0, 0, false, 0);
pub const HIGH_CONTAMINATION_LIMIT: usize = 20;

/// Contamination level bands, 20 points wide
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContaminationDistribution {
    #[serde(rename = "None")]
    pub none: usize,
    #[serde(rename = "Low")]
    pub low: usize,
    #[serde(rename = "Medium")]
    pub medium: usize,
    #[serde(rename = "High")]
    pub high: usize,
    #[serde(rename = "Very High")]
    pub very_high: usize,
}

impl ContaminationDistribution {
    fn add(&mut self, level: Decimal) {
        if level >= Decimal::from(80) {
            self.very_high += 1;
        } else if level >= Decimal::from(60) {
            self.high += 1;
        } else if level >= Decimal::from(40) {
            self.medium += 1;
        } else if level >= Decimal::from(20) {
            self.low += 1;
        } else {
            self.none += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub total_nodes: usize,
    pub bogus_nodes: usize,
    pub bogus_percentage: f64,
    pub contaminated_nodes: usize,
    pub contaminated_percentage: f64,
    pub missing_nodes: usize,
    pub high_risk_nodes: usize,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub total_sales: Decimal,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub total_purchases: Decimal,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub total_bogus_value: Decimal,
    pub nodes_with_bogus_value: usize,
    pub bogus_value_percentage: f64,
    /// Σ purchases / Σ sales, 0 when there are no sales
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub overall_ps_ratio: Decimal,
    pub contamination_distribution: ContaminationDistribution,
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0 * 100.0).round() / 100.0
}

impl AnalysisSummary {
    /// Entities scoring strictly above `risk_threshold` count toward `high_risk_nodes`
    pub fn from_snapshot(snapshot: &GraphSnapshot, risk_threshold: f64) -> Self {
        let nodes = &snapshot.nodes;
        let total_nodes = nodes.len();

        let mut distribution = ContaminationDistribution::default();
        let mut total_sales = Decimal::ZERO;
        let mut total_purchases = Decimal::ZERO;
        let mut total_bogus_value = Decimal::ZERO;
        let mut bogus_nodes = 0;
        let mut contaminated_nodes = 0;
        let mut missing_nodes = 0;
        let mut high_risk_nodes = 0;
        let mut nodes_with_bogus_value = 0;

        for node in nodes {
            total_sales = total_sales.saturating_add(node.total_sales);
            total_purchases = total_purchases.saturating_add(node.total_purchases);
            total_bogus_value = total_bogus_value.saturating_add(node.bogus_value);
            if node.is_bogus {
                bogus_nodes += 1;
            }
            if node.is_contaminated {
                contaminated_nodes += 1;
            }
            if !node.data_available {
                missing_nodes += 1;
            }
            if node.risk_score > risk_threshold {
                high_risk_nodes += 1;
            }
            if node.bogus_value > Decimal::ZERO {
                nodes_with_bogus_value += 1;
            }
            distribution.add(node.contamination_level);
        }

        let overall_ps_ratio = if total_sales > Decimal::ZERO {
            total_purchases
                .checked_div(total_sales)
                .map(|r| r.round_dp(4))
                .unwrap_or(Decimal::MAX)
        } else {
            Decimal::ZERO
        };

        AnalysisSummary {
            total_nodes,
            bogus_nodes,
            bogus_percentage: percentage(bogus_nodes, total_nodes),
            contaminated_nodes,
            contaminated_percentage: percentage(contaminated_nodes, total_nodes),
            missing_nodes,
            high_risk_nodes,
            total_sales,
            total_purchases,
            total_bogus_value,
            nodes_with_bogus_value,
            bogus_value_percentage: percentage(nodes_with_bogus_value, total_nodes),
            overall_ps_ratio,
            contamination_distribution: distribution,
        }
    }
}

/// Entities above 50% contamination, most contaminated first
pub fn high_contamination(snapshot: &GraphSnapshot, limit: usize) -> Vec<&NodeRecord> {
    let mut nodes: Vec<&NodeRecord> = snapshot
        .nodes
        .iter()
        .filter(|n| n.contamination_level > HIGH_CONTAMINATION_LEVEL)
        .collect();
    // Stable sort keeps discovery order among equal levels
    nodes.sort_by(|a, b| b.contamination_level.cmp(&a.contamination_level));
    nodes.truncate(limit);
    nodes
}

/// Sales detail of one seller, as served by the sales endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SalesView<'a> {
    pub seller_pan: &'a str,
    pub seller_name: &'a str,
    pub total_sales_records: usize,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub total_sales_amount: Decimal,
    pub sales_records: &'a [SaleDetail],
}

pub fn sales_view<'a>(snapshot: &'a GraphSnapshot, pan: &str) -> Option<SalesView<'a>> {
    let node = snapshot.node(pan)?;
    let records: &[SaleDetail] = snapshot
        .sales
        .get(pan)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    Some(SalesView {
        seller_pan: &node.pan,
        seller_name: &node.entity_name,
        total_sales_records: records.len(),
        total_sales_amount: records
            .iter()
            .fold(Decimal::ZERO, |acc, r| acc.saturating_add(r.amount)),
        sales_records: records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EntityGraph, EntityNode, Status};
    use crate::parser::tests::dec;

    fn snapshot_with(levels: &[(&str, &str, bool)]) -> GraphSnapshot {
        let mut graph = EntityGraph::new();
        for (id, level, bogus) in levels {
            let mut node = EntityNode::new(id, true);
            node.total_sales = dec("100");
            node.total_purchases = dec("80");
            node.contamination_level = dec(level);
            node.bogus_value = dec(level);
            node.is_bogus = *bogus;
            node.is_contaminated = !*bogus && node.contamination_level > Decimal::ZERO;
            node.risk_score = if *bogus { 75.0 } else { 10.0 };
            node.status = if *bogus { Status::Bogus } else { Status::Ok };
            graph.add_node(node);
        }
        GraphSnapshot::from_graph(&graph).unwrap()
    }

    #[test]
    fn test_summary_totals() {
        let snapshot = snapshot_with(&[
            ("AAAAA1111A", "0", true),
            ("BBBBB2222B", "55", false),
            ("CCCCC3333C", "85", false),
            ("DDDDD4444D", "19.99", false),
        ]);
        let summary = AnalysisSummary::from_snapshot(&snapshot, 70.0);

        assert_eq!(summary.total_nodes, 4);
        assert_eq!(summary.bogus_nodes, 1);
        assert_eq!(summary.bogus_percentage, 25.0);
        assert_eq!(summary.contaminated_nodes, 3);
        assert_eq!(summary.high_risk_nodes, 1);
        assert_eq!(summary.total_sales, dec("400"));
        assert_eq!(summary.overall_ps_ratio, dec("0.8"));
        assert_eq!(summary.nodes_with_bogus_value, 3);

        let d = &summary.contamination_distribution;
        assert_eq!((d.none, d.low, d.medium, d.high, d.very_high), (2, 0, 1, 0, 1));
        println!("✅ Test passed: summary over {} nodes", summary.total_nodes);
    }

    #[test]
    fn test_high_risk_is_strictly_above_threshold() {
        let snapshot = snapshot_with(&[("AAAAA1111A", "0", true), ("BBBBB2222B", "0", false)]);
        assert_eq!(AnalysisSummary::from_snapshot(&snapshot, 75.0).high_risk_nodes, 0);
        assert_eq!(AnalysisSummary::from_snapshot(&snapshot, 74.99).high_risk_nodes, 1);
    }

    #[test]
    fn test_totals_saturate_on_huge_values() {
        let mut graph = EntityGraph::new();
        for id in ["AAAAA1111A", "BBBBB2222B"] {
            let mut node = EntityNode::new(id, true);
            node.total_sales = Decimal::MAX;
            node.total_purchases = Decimal::MAX;
            graph.add_node(node);
        }
        let snapshot = GraphSnapshot::from_graph(&graph).unwrap();

        let summary = AnalysisSummary::from_snapshot(&snapshot, 70.0);
        assert_eq!(summary.total_sales, Decimal::MAX);
        assert_eq!(summary.overall_ps_ratio, Decimal::ONE);
    }

    #[test]
    fn test_empty_snapshot_summary() {
        let summary = AnalysisSummary::from_snapshot(&GraphSnapshot::default(), 70.0);
        assert_eq!(summary.total_nodes, 0);
        assert_eq!(summary.bogus_percentage, 0.0);
        assert_eq!(summary.overall_ps_ratio, Decimal::ZERO);
    }

    #[test]
    fn test_high_contamination_sorted_and_limited() {
        let snapshot = snapshot_with(&[
            ("AAAAA1111A", "50", false),
            ("BBBBB2222B", "60", false),
            ("CCCCC3333C", "90", false),
            ("DDDDD4444D", "75", false),
        ]);
        let ids: Vec<&str> = high_contamination(&snapshot, 2)
            .iter()
            .map(|n| n.pan.as_str())
            .collect();
        assert_eq!(ids, vec!["CCCCC3333C", "DDDDD4444D"]);
        assert_eq!(high_contamination(&snapshot, HIGH_CONTAMINATION_LIMIT).len(), 3);
    }

    #[test]
    fn test_sales_view() {
        let mut graph = EntityGraph::new();
        let mut node = EntityNode::new("AAAAA1111A", true);
        node.entity_name = "Root Co".to_string();
        for amount in ["100.50", "20"] {
            node.sales_records.push(SaleDetail {
                buyer_pan: "BBBBB2222B".to_string(),
                buyer_name: "Beta".to_string(),
                amount: dec(amount),
                taxpayer_type: String::new(),
                business_nature: String::new(),
            });
        }
        graph.add_node(node);
        let snapshot = GraphSnapshot::from_graph(&graph).unwrap();

        let view = sales_view(&snapshot, "AAAAA1111A").unwrap();
        assert_eq!(view.seller_name, "Root Co");
        assert_eq!(view.total_sales_records, 2);
        assert_eq!(view.total_sales_amount, dec("120.50"));
        assert!(sales_view(&snapshot, "ZZZZZ9999Z").is_none());
    }
}
