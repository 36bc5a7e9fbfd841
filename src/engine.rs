//! Decision engine for shortfall financing
//!
//! Pure functions, no session state. Given a snapshot of outstanding bills
//! and the available balance, produce exactly one payment strategy.
//! The LLM is NOT allowed here.

use crate::error::AgentError;
use crate::models::{Bill, FinancingMethod, Money, Strategy, StrategyKind};
use crate::Result;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Result of the greedy cost-density allocation.
struct GreedyPlan {
    pay_now: BTreeSet<String>,
    deferred: BTreeSet<String>,
    /// One day of accrual over the deferred bills. The model assumes the
    /// deferred bills' funding arrives the next day via expected receipts.
    interest_cost: Money,
}

/// Compute the cheapest way to settle `bills` with `balance` on hand.
///
/// Overdue bills are valued at face amount; callers wanting accrued
/// interest priced in must add it as a synthetic charge before calling.
pub fn compute_strategy(bills: &[Bill], balance: Money, as_of: NaiveDate) -> Result<Strategy> {
    validate_bills(bills)?;

    let total_due: Money = bills.iter().map(|b| b.amount).sum();
    let amounts: BTreeMap<String, Money> =
        bills.iter().map(|b| (b.id.clone(), b.amount)).collect();

    if amounts.len() != bills.len() {
        return Err(AgentError::InvariantViolation(
            "duplicate bill ids in decision input".to_string(),
        ));
    }

    debug!(
        bill_count = bills.len(),
        total_due,
        balance,
        %as_of,
        "Computing payment strategy"
    );

    if balance >= total_due {
        return Ok(Strategy {
            kind: StrategyKind::FullBalance,
            pay_now: amounts.keys().cloned().collect(),
            deferred: BTreeSet::new(),
            amounts,
            total_due,
            deficit: 0.0,
            interest_cost: 0.0,
            savings_vs_alternative: 0.0,
        });
    }

    let deficit = total_due - balance;
    let plan = greedy_deferral(bills, balance);

    // Candidates in tie-break preference order: the option needing no
    // external financing first, then the cheaper financing product.
    // None stands for the partial plan; a strictly lower cost is required
    // to displace an earlier candidate.
    let candidates: [(Option<FinancingMethod>, Money); 3] = [
        (None, plan.interest_cost),
        (
            Some(FinancingMethod::WorkingCapital),
            FinancingMethod::WorkingCapital.cost(deficit),
        ),
        (
            Some(FinancingMethod::ReceivablesAdvance),
            FinancingMethod::ReceivablesAdvance.cost(deficit),
        ),
    ];

    let mut chosen = candidates[0];
    for candidate in &candidates[1..] {
        if candidate.1 < chosen.1 {
            chosen = *candidate;
        }
    }
    let (chosen_method, chosen_cost) = chosen;

    let runner_up = candidates
        .iter()
        .filter(|(method, _)| *method != chosen_method)
        .map(|(_, cost)| *cost)
        .fold(f64::INFINITY, f64::min);

    debug!(
        ?chosen_method,
        chosen_cost,
        runner_up,
        deficit,
        "Shortfall strategy selected"
    );

    let strategy = match chosen_method {
        None => Strategy {
            kind: StrategyKind::PartialPayment,
            pay_now: plan.pay_now,
            deferred: plan.deferred,
            amounts,
            total_due,
            deficit,
            interest_cost: plan.interest_cost,
            savings_vs_alternative: runner_up - chosen_cost,
        },
        Some(method) => Strategy {
            kind: StrategyKind::FullFinancing(method),
            pay_now: amounts.keys().cloned().collect(),
            deferred: BTreeSet::new(),
            amounts,
            total_due,
            deficit,
            interest_cost: chosen_cost,
            savings_vs_alternative: runner_up - chosen_cost,
        },
    };

    Ok(strategy)
}

/// Build the partial-payment plan for a bill set whether or not it is the
/// cheapest option, for side-by-side comparisons. Savings compare against
/// financing the whole deficit at the working-capital rate.
pub fn partial_payment_plan(bills: &[Bill], balance: Money) -> Result<Strategy> {
    validate_bills(bills)?;

    let total_due: Money = bills.iter().map(|b| b.amount).sum();
    let amounts: BTreeMap<String, Money> =
        bills.iter().map(|b| (b.id.clone(), b.amount)).collect();
    let deficit = (total_due - balance).max(0.0);
    let plan = greedy_deferral(bills, balance);

    Ok(Strategy {
        kind: StrategyKind::PartialPayment,
        pay_now: plan.pay_now,
        deferred: plan.deferred,
        amounts,
        total_due,
        deficit,
        interest_cost: plan.interest_cost,
        savings_vs_alternative: FinancingMethod::WorkingCapital.cost(deficit)
            - plan.interest_cost,
    })
}

/// Greedy cost-density allocation: pay the costliest-to-defer bills first
/// while the running balance covers them, defer the rest.
fn greedy_deferral(bills: &[Bill], balance: Money) -> GreedyPlan {
    let mut ordered: Vec<&Bill> = bills.iter().collect();

    // Equal densities order by id ascending so a fixed input set always
    // produces the same allocation.
    ordered.sort_by(|a, b| {
        b.deferral_cost()
            .partial_cmp(&a.deferral_cost())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut remaining = balance;
    let mut pay_now = BTreeSet::new();
    let mut deferred = BTreeSet::new();
    let mut interest_cost = 0.0;

    for bill in ordered {
        if remaining >= bill.amount {
            remaining -= bill.amount;
            pay_now.insert(bill.id.clone());
        } else {
            interest_cost += bill.deferral_cost();
            deferred.insert(bill.id.clone());
        }
    }

    GreedyPlan {
        pay_now,
        deferred,
        interest_cost,
    }
}

/// Negative amounts or rates are a data-validity error; the whole
/// computation aborts and no partial result is returned.
fn validate_bills(bills: &[Bill]) -> Result<()> {
    for bill in bills {
        if bill.amount < 0.0 || !bill.amount.is_finite() {
            return Err(AgentError::MalformedBill {
                id: bill.id.clone(),
                reason: format!("negative or non-finite amount {}", bill.amount),
            });
        }
        if bill.daily_interest_rate < 0.0 || !bill.daily_interest_rate.is_finite() {
            return Err(AgentError::MalformedBill {
                id: bill.id.clone(),
                reason: format!(
                    "negative or non-finite daily rate {}",
                    bill.daily_interest_rate
                ),
            });
        }
    }
    Ok(())
}
