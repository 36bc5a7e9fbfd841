//! Core data models for the payment agent

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Monetary amounts are plain f64 in a single implied currency.
pub type Money = f64;

/// Opaque bill identifier, stable for the lifetime of a session.
pub type BillId = String;

//
// ================= Bill =================
//

/// A single payable obligation. Bills are read-only facts sourced from the
/// repository; "paid" status lives in session state, never on the bill.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bill {
    pub id: BillId,
    pub amount: Money,
    /// Fraction of `amount` accrued per day while the bill stays unpaid.
    pub daily_interest_rate: f64,
    pub due_date: NaiveDate,
    /// Display label, not used in decisions.
    pub creditor: String,
}

impl Bill {
    /// Overdue is always relative to the evaluation date, never to a
    /// queried date.
    pub fn is_overdue(&self, as_of: NaiveDate) -> bool {
        self.due_date < as_of
    }

    /// Cost of deferring this bill by one day. Used as the greedy
    /// allocation priority.
    pub fn deferral_cost(&self) -> Money {
        self.amount * self.daily_interest_rate
    }

    /// Interest accrued to date for an overdue bill (display only; the
    /// decision engine works on face amounts).
    pub fn accrued_interest(&self, as_of: NaiveDate) -> Money {
        if !self.is_overdue(as_of) {
            return 0.0;
        }
        let days_late = (as_of - self.due_date).num_days() as f64;
        self.amount * self.daily_interest_rate * days_late
    }
}

//
// ================= Financing =================
//

/// External credit products with a flat rate on the financed amount.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinancingMethod {
    WorkingCapital,
    ReceivablesAdvance,
}

impl FinancingMethod {
    pub fn rate(&self) -> f64 {
        match self {
            FinancingMethod::WorkingCapital => 0.08,
            FinancingMethod::ReceivablesAdvance => 0.15,
        }
    }

    pub fn cost(&self, amount: Money) -> Money {
        amount * self.rate()
    }

    pub fn total_outlay(&self, amount: Money) -> Money {
        amount + self.cost(amount)
    }
}

impl fmt::Display for FinancingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinancingMethod::WorkingCapital => "Working Capital (8%)",
            FinancingMethod::ReceivablesAdvance => "Receivables Advance (15%)",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Strategy =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Balance covers everything; pay all bills now.
    FullBalance,
    /// Finance the deficit and pay all bills now.
    FullFinancing(FinancingMethod),
    /// Pay the costliest-to-defer bills now, leave the rest for the next
    /// expected receipts.
    PartialPayment,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::FullBalance => write!(f, "Full payment from balance"),
            StrategyKind::FullFinancing(m) => write!(f, "Full payment via {}", m),
            StrategyKind::PartialPayment => write!(f, "Smart partial payment"),
        }
    }
}

/// Output of the decision engine: an allocation of bills to pay-now vs.
/// defer, plus the financing method if any.
///
/// `pay_now ∪ deferred` equals the input bill set and the two never overlap.
/// `amounts` snapshots every input bill's face value so a commit can be
/// replayed idempotently without re-querying the repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Strategy {
    pub kind: StrategyKind,
    pub pay_now: BTreeSet<BillId>,
    pub deferred: BTreeSet<BillId>,
    pub amounts: BTreeMap<BillId, Money>,
    pub total_due: Money,
    /// Amount by which `total_due` exceeded the balance at decision time.
    pub deficit: Money,
    /// Monetary cost of the chosen path.
    pub interest_cost: Money,
    /// Cost delta versus the next-best alternative, for reporting only.
    pub savings_vs_alternative: Money,
}

impl Strategy {
    pub fn pay_now_total(&self) -> Money {
        self.pay_now
            .iter()
            .filter_map(|id| self.amounts.get(id))
            .sum()
    }

    pub fn deferred_total(&self) -> Money {
        self.deferred
            .iter()
            .filter_map(|id| self.amounts.get(id))
            .sum()
    }
}

//
// ================= Query Window =================
//

/// The window of the last repository query, kept with its snapshot so
/// follow-up questions can be answered without re-querying.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryWindow {
    Day(NaiveDate),
    Range { start: NaiveDate, end: NaiveDate },
    Overdue,
}
