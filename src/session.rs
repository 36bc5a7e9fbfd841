//! Per-session mutable state
//!
//! Each conversation owns exactly one `SessionState`: cash balance, the
//! ever-growing set of paid bill ids, at most one pending strategy, the
//! current machine state, and the last query snapshot. The registry hands
//! out one exclusively-locked state per session id so independent sessions
//! never serialize on each other.
//!
//! `balance` and `paid_ids` are the only fields with monetary consequence;
//! they change through `commit` alone, and `commit` is all-or-nothing.

use crate::error::AgentError;
use crate::fsm::ChatState;
use crate::history::ConversationLog;
use crate::models::{Bill, BillId, Money, QueryWindow, Strategy, StrategyKind};
use crate::Result;
use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

//
// ================= Query Context =================
//

/// Snapshot of the last repository query. Follow-up questions (details,
/// highlighted values, pay) are answered from here without re-querying;
/// display paths re-filter against `paid_ids` at read time, so a commit
/// between caching and display never resurrects a settled bill.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub window: QueryWindow,
    /// Bills inside the queried window, filtered of paid ids at cache time.
    pub due: Vec<Bill>,
    /// Overdue bills as of the evaluation date (never the queried date),
    /// deduplicated against `due`.
    pub overdue: Vec<Bill>,
    pub as_of: NaiveDate,
}

impl QueryContext {
    /// Everything the `pay` flow would settle: due bills plus overdue ones.
    pub fn payable(&self) -> Vec<Bill> {
        let mut bills = self.due.clone();
        bills.extend(self.overdue.iter().cloned());
        bills
    }

    pub fn find_bill(&self, id: &str) -> Option<&Bill> {
        self.due
            .iter()
            .chain(self.overdue.iter())
            .find(|b| b.id.eq_ignore_ascii_case(id))
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty() && self.overdue.is_empty()
    }
}

//
// ================= Commit =================

/// What a commit actually did, for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    pub newly_paid: Vec<BillId>,
    pub amount_paid: Money,
    /// Credit drawn to fill the gap (zero unless the strategy financed).
    pub financed: Money,
    pub interest_cost: Money,
    pub balance_after: Money,
}

//
// ================= Session State =================
//

#[derive(Debug)]
pub struct SessionState {
    pub session_id: Uuid,
    balance: Money,
    paid_ids: BTreeSet<BillId>,
    pending_strategy: Option<Strategy>,
    state: ChatState,
    query_context: Option<QueryContext>,
    pub log: ConversationLog,
}

impl SessionState {
    pub fn new(session_id: Uuid, opening_balance: Money) -> Self {
        Self {
            session_id,
            balance: opening_balance,
            paid_ids: BTreeSet::new(),
            pending_strategy: None,
            state: ChatState::Start,
            query_context: None,
            log: ConversationLog::new(),
        }
    }

    pub fn balance(&self) -> Money {
        self.balance
    }

    pub fn paid_count(&self) -> usize {
        self.paid_ids.len()
    }

    pub fn is_paid(&self, id: &str) -> bool {
        self.paid_ids.contains(id)
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    pub fn set_state(&mut self, state: ChatState) {
        if state != self.state {
            debug!(session_id = ?self.session_id, from = ?self.state, to = ?state, "State transition");
        }
        self.state = state;
    }

    pub fn pending_strategy(&self) -> Option<&Strategy> {
        self.pending_strategy.as_ref()
    }

    pub fn set_pending_strategy(&mut self, strategy: Strategy) {
        self.pending_strategy = Some(strategy);
    }

    /// Discard the pending strategy without touching balance or paid ids.
    pub fn clear_pending_strategy(&mut self) {
        self.pending_strategy = None;
    }

    pub fn query_context(&self) -> Option<&QueryContext> {
        self.query_context.as_ref()
    }

    pub fn set_query_context(&mut self, context: QueryContext) {
        self.query_context = Some(context);
    }

    /// Drop bills already committed as paid. Every query path goes through
    /// this before displaying or recomputing, so overview totals always
    /// reflect outstanding obligations only.
    pub fn filter_unpaid(&self, bills: Vec<Bill>) -> Vec<Bill> {
        bills
            .into_iter()
            .filter(|b| !self.paid_ids.contains(&b.id))
            .collect()
    }

    /// Apply a strategy's effects exactly once.
    ///
    /// Idempotent: ids already in `paid_ids` are skipped and contribute
    /// nothing to the debit, so re-committing an overlapping strategy
    /// cannot double-subtract. Atomic: every check and computation happens
    /// before the first field is written; an error leaves the session
    /// exactly as it was.
    pub fn commit(&mut self, strategy: &Strategy) -> Result<CommitOutcome> {
        if !strategy.pay_now.is_disjoint(&strategy.deferred) {
            return Err(AgentError::InvariantViolation(
                "strategy pay_now and deferred sets overlap".to_string(),
            ));
        }

        let mut newly_paid = Vec::new();
        let mut unpaid_sum = 0.0;
        for id in &strategy.pay_now {
            if self.paid_ids.contains(id) {
                continue;
            }
            let amount = strategy.amounts.get(id).ok_or_else(|| {
                AgentError::InvariantViolation(format!("strategy has no amount for bill {}", id))
            })?;
            newly_paid.push(id.clone());
            unpaid_sum += amount;
        }

        let (financed, new_balance) = match strategy.kind {
            StrategyKind::FullBalance | StrategyKind::PartialPayment => {
                (0.0, self.balance - unpaid_sum)
            }
            StrategyKind::FullFinancing(_) => {
                // The loan fills exactly the gap on what is still unpaid;
                // principal repayment from future receipts is out of scope.
                let shortfall = (unpaid_sum - self.balance).max(0.0);
                (shortfall, self.balance + shortfall - unpaid_sum)
            }
        };

        if new_balance < -1e-9 {
            return Err(AgentError::InvariantViolation(format!(
                "commit would overdraw balance: {:.2} - {:.2}",
                self.balance, unpaid_sum
            )));
        }

        // Point of no return: both fields change together.
        self.balance = new_balance;
        self.paid_ids.extend(newly_paid.iter().cloned());

        info!(
            session_id = ?self.session_id,
            kind = ?strategy.kind,
            paid = newly_paid.len(),
            amount_paid = unpaid_sum,
            financed,
            balance_after = self.balance,
            "Strategy committed"
        );

        Ok(CommitOutcome {
            newly_paid,
            amount_paid: unpaid_sum,
            financed,
            interest_cost: strategy.interest_cost,
            balance_after: self.balance,
        })
    }
}

//
// ================= Registry =================
//

/// One exclusively-locked state per session id. The outer map lock is held
/// only long enough to clone the per-session handle; turns serialize on
/// the session's own mutex, never on each other's.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<SessionState>>>>,
    opening_balance: Money,
}

impl SessionRegistry {
    pub fn new(opening_balance: Money) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            opening_balance,
        }
    }

    pub async fn get_or_create(&self, session_id: Uuid) -> Arc<Mutex<SessionState>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&session_id) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id)
            .or_insert_with(|| {
                info!(?session_id, "Creating session");
                Arc::new(Mutex::new(SessionState::new(
                    session_id,
                    self.opening_balance,
                )))
            })
            .clone()
    }

    pub async fn get(&self, session_id: Uuid) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn strategy(
        kind: StrategyKind,
        pay_now: &[(&str, Money)],
        deferred: &[(&str, Money)],
        interest_cost: Money,
    ) -> Strategy {
        let amounts: BTreeMap<BillId, Money> = pay_now
            .iter()
            .chain(deferred.iter())
            .map(|(id, amount)| (id.to_string(), *amount))
            .collect();
        let total_due: Money = amounts.values().sum();

        Strategy {
            kind,
            pay_now: pay_now.iter().map(|(id, _)| id.to_string()).collect(),
            deferred: deferred.iter().map(|(id, _)| id.to_string()).collect(),
            amounts,
            total_due,
            deficit: 0.0,
            interest_cost,
            savings_vs_alternative: 0.0,
        }
    }

    fn session(balance: Money) -> SessionState {
        SessionState::new(Uuid::new_v4(), balance)
    }

    #[test]
    fn test_full_balance_commit_is_exact() {
        let mut s = session(1000.0);
        let strategy = strategy(StrategyKind::FullBalance, &[("A", 1000.0)], &[], 0.0);

        let outcome = s.commit(&strategy).unwrap();
        assert_eq!(outcome.amount_paid, 1000.0);
        assert_eq!(s.balance(), 0.0);
        assert!(s.is_paid("A"));
    }

    #[test]
    fn test_double_commit_is_a_no_op() {
        let mut s = session(2000.0);
        let strategy = strategy(
            StrategyKind::PartialPayment,
            &[("A", 1000.0)],
            &[("B", 1000.0)],
            1.0,
        );

        s.commit(&strategy).unwrap();
        let balance_once = s.balance();
        let paid_once = s.paid_count();

        let second = s.commit(&strategy).unwrap();
        assert_eq!(s.balance(), balance_once);
        assert_eq!(s.paid_count(), paid_once);
        assert!(second.newly_paid.is_empty());
        assert_eq!(second.amount_paid, 0.0);
    }

    #[test]
    fn test_overlapping_sets_rejected_without_mutation() {
        let mut s = session(500.0);
        let mut bad = strategy(StrategyKind::PartialPayment, &[("A", 100.0)], &[], 0.0);
        bad.deferred.insert("A".to_string());

        let err = s.commit(&bad).unwrap_err();
        assert!(matches!(err, AgentError::InvariantViolation(_)));
        assert_eq!(s.balance(), 500.0);
        assert_eq!(s.paid_count(), 0);
    }

    #[test]
    fn test_missing_amount_rejected_without_mutation() {
        let mut s = session(500.0);
        let mut bad = strategy(StrategyKind::FullBalance, &[("A", 100.0)], &[], 0.0);
        bad.amounts.clear();

        assert!(s.commit(&bad).is_err());
        assert_eq!(s.balance(), 500.0);
        assert_eq!(s.paid_count(), 0);
    }

    #[test]
    fn test_financing_commit_nets_to_zero_when_all_unpaid() {
        let mut s = session(1000.0);
        let strategy = strategy(
            StrategyKind::FullFinancing(crate::models::FinancingMethod::WorkingCapital),
            &[("A", 1000.0), ("B", 1000.0)],
            &[],
            80.0,
        );

        let outcome = s.commit(&strategy).unwrap();
        assert_eq!(outcome.financed, 1000.0);
        assert_eq!(outcome.amount_paid, 2000.0);
        assert_eq!(s.balance(), 0.0);
        assert!(s.is_paid("A") && s.is_paid("B"));
    }

    #[test]
    fn test_financing_recommit_draws_nothing() {
        let mut s = session(1000.0);
        let strategy = strategy(
            StrategyKind::FullFinancing(crate::models::FinancingMethod::WorkingCapital),
            &[("A", 1000.0), ("B", 1000.0)],
            &[],
            80.0,
        );

        s.commit(&strategy).unwrap();
        let outcome = s.commit(&strategy).unwrap();
        assert_eq!(outcome.financed, 0.0);
        assert_eq!(s.balance(), 0.0);
    }

    #[test]
    fn test_overdraw_rejected_without_mutation() {
        let mut s = session(100.0);
        let strategy = strategy(StrategyKind::FullBalance, &[("A", 1000.0)], &[], 0.0);

        assert!(s.commit(&strategy).is_err());
        assert_eq!(s.balance(), 100.0);
        assert_eq!(s.paid_count(), 0);
    }

    #[test]
    fn test_filter_unpaid_excludes_committed_bills() {
        let mut s = session(2000.0);
        let strategy = strategy(StrategyKind::FullBalance, &[("A", 1000.0)], &[], 0.0);
        s.commit(&strategy).unwrap();

        let bills = vec![
            Bill {
                id: "A".to_string(),
                amount: 1000.0,
                daily_interest_rate: 0.05,
                due_date: NaiveDate::from_ymd_opt(2025, 10, 20).unwrap(),
                creditor: "X".to_string(),
            },
            Bill {
                id: "B".to_string(),
                amount: 1000.0,
                daily_interest_rate: 0.001,
                due_date: NaiveDate::from_ymd_opt(2025, 10, 20).unwrap(),
                creditor: "Y".to_string(),
            },
        ];

        let outstanding = s.filter_unpaid(bills);
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].id, "B");
        let total: Money = outstanding.iter().map(|b| b.amount).sum();
        assert_eq!(total, 1000.0);
    }

    #[tokio::test]
    async fn test_registry_hands_out_one_state_per_session() {
        let registry = SessionRegistry::new(5000.0);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = registry.get_or_create(a).await;
        let again = registry.get_or_create(a).await;
        let other = registry.get_or_create(b).await;

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.session_count().await, 2);

        first.lock().await.set_state(ChatState::MainMenu);
        assert_eq!(other.lock().await.state(), ChatState::Start);
    }
}
