//! The two edge payload families.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::buffer::EdgeOperation;
use crate::primary::PrimaryEndpoint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLine {
    pub sku: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

/// What a point-of-sale terminal records.
///
/// Sales decrement stock on the primary, so replay order matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PosOperation {
    Sale {
        terminal_id: String,
        receipt_no: u64,
        lines: Vec<SaleLine>,
        sold_at: DateTime<Utc>,
    },
    Refund {
        terminal_id: String,
        receipt_no: u64,
        original_receipt_no: u64,
        lines: Vec<SaleLine>,
        refunded_at: DateTime<Utc>,
    },
    CashCount {
        terminal_id: String,
        counted_cents: i64,
        counted_at: DateTime<Utc>,
    },
}

impl PosOperation {
    pub fn total_cents(&self) -> i64 {
        match self {
            PosOperation::Sale { lines, .. } => lines.iter().map(|l| l.quantity * l.unit_price_cents).sum(),
            PosOperation::Refund { lines, .. } => -lines.iter().map(|l| l.quantity * l.unit_price_cents).sum::<i64>(),
            PosOperation::CashCount { .. } => 0,
        }
    }
}

impl EdgeOperation for PosOperation {
    const FAMILY: &'static str = "pos";
}

impl PrimaryEndpoint for PosOperation {
    const PATH: &'static str = "pos/operations";
}

/// One measurement from a collecting agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub agent_id: String,
    pub metric: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn now(agent_id: impl Into<String>, metric: impl Into<String>, value: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            metric: metric.into(),
            value,
            recorded_at: Utc::now(),
        }
    }
}

impl EdgeOperation for TelemetrySample {
    const FAMILY: &'static str = "telemetry";
}

impl PrimaryEndpoint for TelemetrySample {
    const PATH: &'static str = "telemetry/samples";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refund_total_is_negative() {
        let lines = vec![SaleLine { sku: "A".into(), quantity: 2, unit_price_cents: 150 }];
        let refund = PosOperation::Refund {
            terminal_id: "t1".into(),
            receipt_no: 9,
            original_receipt_no: 4,
            lines,
            refunded_at: Utc::now(),
        };
        assert_eq!(refund.total_cents(), -300);
    }

    #[test]
    fn operations_are_tagged_by_type() {
        let op = PosOperation::CashCount { terminal_id: "t1".into(), counted_cents: 0, counted_at: Utc::now() };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "cash_count");
    }
}
