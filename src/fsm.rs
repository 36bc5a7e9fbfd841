//! Conversation state machine
//!
//! Dispatches a classified intent against the session's current state,
//! calls the decision engine when a shortfall shows up, and commits a
//! chosen strategy exactly once. Returns a structured payload; prose is a
//! collaborator's job.
//!
//! Turns run in two phases: every repository call for the turn completes
//! before the first session field is written, so a collaborator failure or
//! timeout can never leave a half-mutated session behind.

use crate::classifier::{Intent, TurnParams};
use crate::engine;
use crate::history::TurnRole;
use crate::models::{Bill, FinancingMethod, Money, QueryWindow, Strategy, StrategyKind};
use crate::repository::BillRepository;
use crate::session::{QueryContext, SessionRegistry, SessionState};
use crate::Result;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

//
// ================= States =================
//

/// Conversation states. The machine is long-lived per session and always
/// returns to `MainMenu` after a completed action or cancellation.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Start,
    MainMenu,
    AwaitingDate,
    AwaitingRange,
    DayOverview,
    RangeOverview,
    BillDetail,
    PaymentConfirmation,
    OverdueList,
}

//
// ================= Response Payloads =================
//

/// One bill as shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct BillLine {
    pub id: String,
    pub creditor: String,
    pub amount: Money,
    pub due_date: NaiveDate,
    pub overdue: bool,
}

impl BillLine {
    fn from_bill(bill: &Bill, as_of: NaiveDate) -> Self {
        Self {
            id: bill.id.clone(),
            creditor: bill.creditor.clone(),
            amount: bill.amount,
            due_date: bill.due_date,
            overdue: bill.is_overdue(as_of),
        }
    }
}

/// Decision-engine verdict attached to an overview.
#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub kind: StrategyKind,
    pub deficit: Money,
    pub interest_cost: Money,
    pub savings_vs_alternative: Money,
    pub pay_now_total: Money,
    pub deferred_total: Money,
}

impl From<&Strategy> for Suggestion {
    fn from(strategy: &Strategy) -> Self {
        Self {
            kind: strategy.kind,
            deficit: strategy.deficit,
            interest_cost: strategy.interest_cost,
            savings_vs_alternative: strategy.savings_vs_alternative,
            pay_now_total: strategy.pay_now_total(),
            deferred_total: strategy.deferred_total(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OverviewReport {
    pub date: NaiveDate,
    pub due: Vec<BillLine>,
    pub due_total: Money,
    pub overdue: Vec<BillLine>,
    pub overdue_total: Money,
    pub balance: Money,
    pub suggestion: Option<Suggestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayCount {
    pub date: NaiveDate,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayValue {
    pub date: NaiveDate,
    pub total: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct UrgentDay {
    pub date: NaiveDate,
    pub bills: Vec<BillLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeReport {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub busiest_days: Vec<DayCount>,
    pub heaviest_days: Vec<DayValue>,
    pub overdue_count: usize,
    pub overdue_total: Money,
    pub urgent: Vec<UrgentDay>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartialPlanReport {
    pub pay_now: Vec<BillLine>,
    pub deferred: Vec<BillLine>,
    pub pay_now_total: Money,
    pub deferred_total: Money,
    pub interest_cost: Money,
    pub savings: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub total_due: Money,
    pub balance: Money,
    pub deficit: Money,
    pub working_capital_cost: Money,
    pub working_capital_outlay: Money,
    pub receivables_cost: Money,
    pub receivables_outlay: Money,
    pub partial: PartialPlanReport,
    pub recommended: StrategyKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationReport {
    pub kind: StrategyKind,
    pub pay_now: Vec<BillLine>,
    pub deferred: Vec<BillLine>,
    pub pay_now_total: Money,
    pub deferred_total: Money,
    pub interest_cost: Money,
    pub balance: Money,
    /// Projected balance if the user confirms.
    pub balance_after: Money,
    /// Credit that would be drawn to fill the gap.
    pub financed: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub kind: StrategyKind,
    pub paid_count: usize,
    pub amount_paid: Money,
    pub financed: Money,
    pub interest_cost: Money,
    pub balance: Money,
    pub deferred: Vec<BillLine>,
}

/// Structured turn result. An external renderer turns this into prose;
/// the machine itself never formats user-facing text.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContext {
    Welcome {
        balance: Money,
        overview: Option<OverviewReport>,
    },
    DayOverview(OverviewReport),
    RangeOverview(RangeReport),
    HighlightedValues(RangeReport),
    OverdueList {
        bills: Vec<BillLine>,
        total: Money,
    },
    BillList {
        bills: Vec<BillLine>,
        total: Money,
        balance: Money,
    },
    BillDetail {
        bill: BillLine,
        accrued_interest: Money,
    },
    FinancingComparison(ComparisonReport),
    ConfirmationPrompt(ConfirmationReport),
    Committed(CommitReport),
    /// Nothing outstanding — all bills in the context are settled.
    NothingToPay {
        balance: Money,
    },
    /// Balance covers everything; no financing product required.
    FinancingUnnecessary {
        total_due: Money,
        balance: Money,
    },
    PromptDate,
    PromptRange,
    InvalidDate {
        input: String,
    },
    InvalidRange {
        input: String,
    },
    UnknownBillCode {
        token: String,
    },
    /// The request needs an overview or range query first.
    NeedQueryFirst {
        needed: &'static str,
    },
    ReturnedToMenu {
        balance: Money,
    },
    Help {
        balance: Money,
        paid_count: usize,
    },
    Unrecognized {
        balance: Money,
    },
}

impl ResponseContext {
    /// Short tag for the conversation log and tracing.
    pub fn label(&self) -> &'static str {
        match self {
            ResponseContext::Welcome { .. } => "welcome",
            ResponseContext::DayOverview(_) => "day_overview",
            ResponseContext::RangeOverview(_) => "range_overview",
            ResponseContext::HighlightedValues(_) => "highlighted_values",
            ResponseContext::OverdueList { .. } => "overdue_list",
            ResponseContext::BillList { .. } => "bill_list",
            ResponseContext::BillDetail { .. } => "bill_detail",
            ResponseContext::FinancingComparison(_) => "financing_comparison",
            ResponseContext::ConfirmationPrompt(_) => "confirmation_prompt",
            ResponseContext::Committed(_) => "committed",
            ResponseContext::NothingToPay { .. } => "nothing_to_pay",
            ResponseContext::FinancingUnnecessary { .. } => "financing_unnecessary",
            ResponseContext::PromptDate => "prompt_date",
            ResponseContext::PromptRange => "prompt_range",
            ResponseContext::InvalidDate { .. } => "invalid_date",
            ResponseContext::InvalidRange { .. } => "invalid_range",
            ResponseContext::UnknownBillCode { .. } => "unknown_bill_code",
            ResponseContext::NeedQueryFirst { .. } => "need_query_first",
            ResponseContext::ReturnedToMenu { .. } => "returned_to_menu",
            ResponseContext::Help { .. } => "help",
            ResponseContext::Unrecognized { .. } => "unrecognized",
        }
    }
}

//
// ================= Turn Handler =================
//

/// Drives one session turn: reads state, calls collaborators, mutates the
/// session, returns the structured response plus the next state.
pub struct TurnHandler {
    repository: Arc<dyn BillRepository>,
    sessions: Arc<SessionRegistry>,
    company_id: String,
    fixed_today: Option<NaiveDate>,
}

impl TurnHandler {
    pub fn new(
        repository: Arc<dyn BillRepository>,
        sessions: Arc<SessionRegistry>,
        company_id: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            sessions,
            company_id: company_id.into(),
            fixed_today: None,
        }
    }

    /// Pin the evaluation date; scripted runs and tests need reproducible
    /// "today".
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.fixed_today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.fixed_today.unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// State machine entry point.
    pub async fn handle_turn(
        &self,
        session_id: Uuid,
        intent: Intent,
        params: TurnParams,
    ) -> Result<(ResponseContext, ChatState)> {
        let session = self.sessions.get_or_create(session_id).await;
        let mut session = session.lock().await;
        let as_of = self.today();

        info!(?session_id, ?intent, state = ?session.state(), "Handling turn");

        if let Some(raw) = params.raw_message.as_deref() {
            session.log.record(TurnRole::User, raw);
        }

        let context = self.dispatch(&mut session, intent, &params, as_of).await?;

        session.log.record(TurnRole::Bot, context.label());
        Ok((context, session.state()))
    }

    async fn dispatch(
        &self,
        session: &mut SessionState,
        intent: Intent,
        params: &TurnParams,
        as_of: NaiveDate,
    ) -> Result<ResponseContext> {
        // The very first turn always lands in the menu, whatever was said.
        if session.state() == ChatState::Start {
            session.set_state(ChatState::MainMenu);
            return Ok(ResponseContext::Welcome {
                balance: session.balance(),
                overview: None,
            });
        }

        // Date prompts consume the next message as their answer unless a
        // stronger intent was recognized.
        if session.state() == ChatState::AwaitingDate
            && matches!(intent, Intent::Unknown | Intent::ViewDate)
        {
            return self.answer_date_prompt(session, params, as_of).await;
        }
        // A lone date while a range is expected is malformed input for the
        // prompt, not a day query.
        if session.state() == ChatState::AwaitingRange
            && matches!(intent, Intent::Unknown | Intent::ViewRange | Intent::ViewDate)
        {
            return self.answer_range_prompt(session, params, as_of).await;
        }

        // A bill-code prompt treats free text as a code lookup.
        if session.state() == ChatState::BillDetail && intent == Intent::Unknown {
            let token = params
                .bill_id
                .clone()
                .or_else(|| params.raw_message.as_deref().map(|m| m.trim().to_string()))
                .unwrap_or_default();
            return Ok(self.show_bill_detail(session, &token, as_of));
        }

        match intent {
            Intent::Greeting => self.greet(session, as_of).await,
            Intent::ViewToday => self.show_day(session, as_of, as_of).await,
            Intent::ViewDate => match params.date {
                Some(date) => self.show_day(session, date, as_of).await,
                None => {
                    session.set_state(ChatState::AwaitingDate);
                    Ok(ResponseContext::PromptDate)
                }
            },
            Intent::ViewRange => match (params.date, params.end_date) {
                (Some(start), Some(end)) => self.show_range(session, start, end, as_of).await,
                _ => {
                    session.set_state(ChatState::AwaitingRange);
                    Ok(ResponseContext::PromptRange)
                }
            },
            Intent::ViewOverdue => self.show_overdue(session, as_of).await,
            Intent::ViewFinancingOptions => self.show_financing_options(session, as_of),
            Intent::Pay => self.handle_pay(session, as_of),
            Intent::ViewDetails => Ok(self.show_details(session, params, as_of)),
            Intent::ViewHighlightedValues => Ok(self.show_highlighted_values(session, as_of)),
            Intent::GoBack => {
                if session.state() == ChatState::PaymentConfirmation {
                    session.clear_pending_strategy();
                }
                session.set_state(ChatState::MainMenu);
                Ok(ResponseContext::ReturnedToMenu {
                    balance: session.balance(),
                })
            }
            Intent::Help => Ok(ResponseContext::Help {
                balance: session.balance(),
                paid_count: session.paid_count(),
            }),
            Intent::Unknown => Ok(ResponseContext::Unrecognized {
                balance: session.balance(),
            }),
        }
    }

    //
    // ================= Views =================
    //

    async fn greet(
        &self,
        session: &mut SessionState,
        as_of: NaiveDate,
    ) -> Result<ResponseContext> {
        // A repository hiccup degrades the greeting to the bare welcome
        // instead of failing the turn.
        match self.build_overview(session, as_of, as_of).await {
            Ok((report, context)) => {
                session.set_query_context(context);
                session.set_state(ChatState::DayOverview);
                Ok(ResponseContext::Welcome {
                    balance: session.balance(),
                    overview: Some(report),
                })
            }
            Err(error) => {
                warn!(%error, "Greeting overview unavailable");
                session.set_state(ChatState::MainMenu);
                Ok(ResponseContext::Welcome {
                    balance: session.balance(),
                    overview: None,
                })
            }
        }
    }

    async fn show_day(
        &self,
        session: &mut SessionState,
        date: NaiveDate,
        as_of: NaiveDate,
    ) -> Result<ResponseContext> {
        let (report, context) = self.build_overview(session, date, as_of).await?;
        session.set_query_context(context);
        session.set_state(ChatState::DayOverview);
        Ok(ResponseContext::DayOverview(report))
    }

    /// Fetch + filter + decide, without touching the session. The caller
    /// applies the context and state once everything has succeeded.
    async fn build_overview(
        &self,
        session: &SessionState,
        date: NaiveDate,
        as_of: NaiveDate,
    ) -> Result<(OverviewReport, QueryContext)> {
        let due = self
            .repository
            .fetch_due_on_date(&self.company_id, date)
            .await?;
        let overdue = self.repository.fetch_overdue(&self.company_id, as_of).await?;

        let due = session.filter_unpaid(due);
        let mut overdue = session.filter_unpaid(overdue);
        // A bill due on the queried (past) date is already in `due`.
        overdue.retain(|b| !due.iter().any(|d| d.id == b.id));

        let context = QueryContext {
            window: QueryWindow::Day(date),
            due,
            overdue,
            as_of,
        };

        let payable = context.payable();
        let suggestion = if payable.is_empty() {
            None
        } else {
            match engine::compute_strategy(&payable, session.balance(), as_of) {
                Ok(strategy) => Some(Suggestion::from(&strategy)),
                Err(error) => {
                    // The overview is still useful without a verdict.
                    warn!(%error, "Suggestion unavailable for overview");
                    None
                }
            }
        };

        let report = OverviewReport {
            date,
            due_total: context.due.iter().map(|b| b.amount).sum(),
            overdue_total: context.overdue.iter().map(|b| b.amount).sum(),
            due: context.due.iter().map(|b| BillLine::from_bill(b, as_of)).collect(),
            overdue: context
                .overdue
                .iter()
                .map(|b| BillLine::from_bill(b, as_of))
                .collect(),
            balance: session.balance(),
            suggestion,
        };

        Ok((report, context))
    }

    async fn show_range(
        &self,
        session: &mut SessionState,
        start: NaiveDate,
        end: NaiveDate,
        as_of: NaiveDate,
    ) -> Result<ResponseContext> {
        if end < start {
            session.set_state(ChatState::AwaitingRange);
            return Ok(ResponseContext::InvalidRange {
                input: format!("{} until {}", start, end),
            });
        }

        let bills = self
            .repository
            .fetch_range(&self.company_id, start, end)
            .await?;
        let overdue = self.repository.fetch_overdue(&self.company_id, as_of).await?;

        let due = session.filter_unpaid(bills);
        let mut overdue = session.filter_unpaid(overdue);
        overdue.retain(|b| !due.iter().any(|d| d.id == b.id));

        let context = QueryContext {
            window: QueryWindow::Range { start, end },
            due,
            overdue,
            as_of,
        };

        let report = build_range_report(&context, start, end, as_of);

        session.set_query_context(context);
        session.set_state(ChatState::RangeOverview);
        Ok(ResponseContext::RangeOverview(report))
    }

    async fn show_overdue(
        &self,
        session: &mut SessionState,
        as_of: NaiveDate,
    ) -> Result<ResponseContext> {
        let overdue = self.repository.fetch_overdue(&self.company_id, as_of).await?;
        let overdue = session.filter_unpaid(overdue);

        let context = QueryContext {
            window: QueryWindow::Overdue,
            due: Vec::new(),
            overdue,
            as_of,
        };

        let total = context.overdue.iter().map(|b| b.amount).sum();
        let bills = context
            .overdue
            .iter()
            .map(|b| BillLine::from_bill(b, as_of))
            .collect();

        session.set_query_context(context);
        session.set_state(ChatState::OverdueList);
        Ok(ResponseContext::OverdueList { bills, total })
    }

    //
    // ================= Financing & Payment =================
    //

    fn show_financing_options(
        &self,
        session: &mut SessionState,
        as_of: NaiveDate,
    ) -> Result<ResponseContext> {
        let Some(context) = session.query_context() else {
            return Ok(ResponseContext::NeedQueryFirst { needed: "overview" });
        };

        let payable = session.filter_unpaid(context.payable());
        if payable.is_empty() {
            return Ok(ResponseContext::NothingToPay {
                balance: session.balance(),
            });
        }

        let total_due: Money = payable.iter().map(|b| b.amount).sum();
        let balance = session.balance();
        if balance >= total_due {
            return Ok(ResponseContext::FinancingUnnecessary { total_due, balance });
        }

        let deficit = total_due - balance;
        let partial = engine::partial_payment_plan(&payable, balance)?;
        let recommended = engine::compute_strategy(&payable, balance, as_of)?;

        let report = ComparisonReport {
            total_due,
            balance,
            deficit,
            working_capital_cost: FinancingMethod::WorkingCapital.cost(deficit),
            working_capital_outlay: FinancingMethod::WorkingCapital.total_outlay(deficit),
            receivables_cost: FinancingMethod::ReceivablesAdvance.cost(deficit),
            receivables_outlay: FinancingMethod::ReceivablesAdvance.total_outlay(deficit),
            partial: partial_plan_report(&partial, &payable, as_of),
            recommended: recommended.kind,
        };

        session.set_pending_strategy(recommended);
        session.set_state(ChatState::PaymentConfirmation);
        Ok(ResponseContext::FinancingComparison(report))
    }

    fn handle_pay(&self, session: &mut SessionState, as_of: NaiveDate) -> Result<ResponseContext> {
        match session.state() {
            // Second `pay` commits the cached strategy exactly once.
            ChatState::PaymentConfirmation => {
                let Some(strategy) = session.pending_strategy().cloned() else {
                    session.set_state(ChatState::MainMenu);
                    return Ok(ResponseContext::NeedQueryFirst { needed: "overview" });
                };

                let deferred_lines = self.deferred_lines(session, &strategy, as_of);
                let outcome = session.commit(&strategy)?;
                session.clear_pending_strategy();
                session.set_state(ChatState::MainMenu);

                Ok(ResponseContext::Committed(CommitReport {
                    kind: strategy.kind,
                    paid_count: outcome.newly_paid.len(),
                    amount_paid: outcome.amount_paid,
                    financed: outcome.financed,
                    interest_cost: outcome.interest_cost,
                    balance: outcome.balance_after,
                    deferred: deferred_lines,
                }))
            }

            // First `pay` after an overview computes and caches the plan.
            ChatState::DayOverview | ChatState::BillDetail | ChatState::OverdueList => {
                let Some(context) = session.query_context() else {
                    return Ok(ResponseContext::NeedQueryFirst { needed: "overview" });
                };

                let payable = session.filter_unpaid(context.payable());
                if payable.is_empty() {
                    session.set_state(ChatState::MainMenu);
                    return Ok(ResponseContext::NothingToPay {
                        balance: session.balance(),
                    });
                }

                // A validation error aborts the transition: state and
                // pending strategy stay as they were.
                let strategy = engine::compute_strategy(&payable, session.balance(), as_of)?;
                let report = self.confirmation_report(session, &strategy, &payable, as_of);

                session.set_pending_strategy(strategy);
                session.set_state(ChatState::PaymentConfirmation);
                Ok(ResponseContext::ConfirmationPrompt(report))
            }

            _ => Ok(ResponseContext::NeedQueryFirst { needed: "overview" }),
        }
    }

    fn confirmation_report(
        &self,
        session: &SessionState,
        strategy: &Strategy,
        payable: &[Bill],
        as_of: NaiveDate,
    ) -> ConfirmationReport {
        let by_id: BTreeMap<&str, &Bill> =
            payable.iter().map(|b| (b.id.as_str(), b)).collect();

        let lines = |ids: &std::collections::BTreeSet<String>| -> Vec<BillLine> {
            ids.iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .map(|b| BillLine::from_bill(b, as_of))
                .collect()
        };

        let balance = session.balance();
        let pay_now_total = strategy.pay_now_total();
        let (financed, balance_after) = match strategy.kind {
            StrategyKind::FullBalance | StrategyKind::PartialPayment => {
                (0.0, balance - pay_now_total)
            }
            StrategyKind::FullFinancing(_) => {
                let shortfall = (pay_now_total - balance).max(0.0);
                (shortfall, balance + shortfall - pay_now_total)
            }
        };

        ConfirmationReport {
            kind: strategy.kind,
            pay_now: lines(&strategy.pay_now),
            deferred: lines(&strategy.deferred),
            pay_now_total,
            deferred_total: strategy.deferred_total(),
            interest_cost: strategy.interest_cost,
            balance,
            balance_after,
            financed,
        }
    }

    fn deferred_lines(
        &self,
        session: &SessionState,
        strategy: &Strategy,
        as_of: NaiveDate,
    ) -> Vec<BillLine> {
        let Some(context) = session.query_context() else {
            return Vec::new();
        };
        strategy
            .deferred
            .iter()
            .filter_map(|id| context.find_bill(id))
            .map(|b| BillLine::from_bill(b, as_of))
            .collect()
    }

    //
    // ================= Details & Highlights =================
    //

    fn show_details(
        &self,
        session: &mut SessionState,
        params: &TurnParams,
        as_of: NaiveDate,
    ) -> ResponseContext {
        if let Some(token) = params.bill_id.as_deref() {
            return self.show_bill_detail(session, token, as_of);
        }

        let outstanding = match session.query_context() {
            Some(context) => session.filter_unpaid(context.payable()),
            None => return ResponseContext::NeedQueryFirst { needed: "overview" },
        };
        if outstanding.is_empty() {
            session.set_state(ChatState::MainMenu);
            return ResponseContext::NothingToPay {
                balance: session.balance(),
            };
        }

        let total = outstanding.iter().map(|b| b.amount).sum();
        let bills = outstanding
            .iter()
            .map(|b| BillLine::from_bill(b, as_of))
            .collect();

        session.set_state(ChatState::BillDetail);
        ResponseContext::BillList {
            bills,
            total,
            balance: session.balance(),
        }
    }

    fn show_bill_detail(
        &self,
        session: &mut SessionState,
        token: &str,
        as_of: NaiveDate,
    ) -> ResponseContext {
        let Some(context) = session.query_context() else {
            return ResponseContext::NeedQueryFirst { needed: "overview" };
        };

        let found = context.find_bill(token).cloned();
        match found {
            Some(bill) if !session.is_paid(&bill.id) => {
                session.set_state(ChatState::BillDetail);
                ResponseContext::BillDetail {
                    accrued_interest: bill.accrued_interest(as_of),
                    bill: BillLine::from_bill(&bill, as_of),
                }
            }
            _ => {
                session.set_state(ChatState::BillDetail);
                ResponseContext::UnknownBillCode {
                    token: token.to_string(),
                }
            }
        }
    }

    fn show_highlighted_values(
        &self,
        session: &mut SessionState,
        as_of: NaiveDate,
    ) -> ResponseContext {
        let Some(context) = session.query_context() else {
            return ResponseContext::NeedQueryFirst { needed: "range" };
        };
        let QueryWindow::Range { start, end } = context.window else {
            return ResponseContext::NeedQueryFirst { needed: "range" };
        };

        // Re-filter at display time: bills committed since the range was
        // cached must not resurface.
        let filtered = QueryContext {
            window: context.window,
            due: session.filter_unpaid(context.due.clone()),
            overdue: session.filter_unpaid(context.overdue.clone()),
            as_of: context.as_of,
        };

        let report = build_range_report(&filtered, start, end, as_of);
        ResponseContext::HighlightedValues(report)
    }

    //
    // ================= Prompt Answers =================
    //

    async fn answer_date_prompt(
        &self,
        session: &mut SessionState,
        params: &TurnParams,
        as_of: NaiveDate,
    ) -> Result<ResponseContext> {
        let parsed = params.date.or_else(|| {
            params
                .raw_message
                .as_deref()
                .and_then(|raw| NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok())
        });

        match parsed {
            Some(date) => self.show_day(session, date, as_of).await,
            None => Ok(ResponseContext::InvalidDate {
                input: params.raw_message.clone().unwrap_or_default(),
            }),
        }
    }

    async fn answer_range_prompt(
        &self,
        session: &mut SessionState,
        params: &TurnParams,
        as_of: NaiveDate,
    ) -> Result<ResponseContext> {
        match (params.date, params.end_date) {
            (Some(start), Some(end)) => self.show_range(session, start, end, as_of).await,
            _ => Ok(ResponseContext::InvalidRange {
                input: params.raw_message.clone().unwrap_or_default(),
            }),
        }
    }
}

//
// ================= Report Builders =================
//

fn partial_plan_report(strategy: &Strategy, payable: &[Bill], as_of: NaiveDate) -> PartialPlanReport {
    let by_id: BTreeMap<&str, &Bill> = payable.iter().map(|b| (b.id.as_str(), b)).collect();
    let lines = |ids: &std::collections::BTreeSet<String>| -> Vec<BillLine> {
        ids.iter()
            .filter_map(|id| by_id.get(id.as_str()))
            .map(|b| BillLine::from_bill(b, as_of))
            .collect()
    };

    PartialPlanReport {
        pay_now: lines(&strategy.pay_now),
        deferred: lines(&strategy.deferred),
        pay_now_total: strategy.pay_now_total(),
        deferred_total: strategy.deferred_total(),
        interest_cost: strategy.interest_cost,
        savings: strategy.savings_vs_alternative,
    }
}

fn build_range_report(
    context: &QueryContext,
    start: NaiveDate,
    end: NaiveDate,
    as_of: NaiveDate,
) -> RangeReport {
    let mut by_day: BTreeMap<NaiveDate, Vec<&Bill>> = BTreeMap::new();
    for bill in &context.due {
        by_day.entry(bill.due_date).or_default().push(bill);
    }

    let mut busiest: Vec<DayCount> = by_day
        .iter()
        .map(|(date, bills)| DayCount {
            date: *date,
            count: bills.len(),
        })
        .collect();
    busiest.sort_by(|a, b| b.count.cmp(&a.count).then(a.date.cmp(&b.date)));
    busiest.truncate(3);

    let mut heaviest: Vec<DayValue> = by_day
        .iter()
        .map(|(date, bills)| DayValue {
            date: *date,
            total: bills.iter().map(|b| b.amount).sum(),
        })
        .collect();
    heaviest.sort_by(|a, b| {
        b.total
            .partial_cmp(&a.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.date.cmp(&b.date))
    });
    heaviest.truncate(3);

    // The first days of the window carry the urgency.
    let urgent: Vec<UrgentDay> = by_day
        .iter()
        .take(3)
        .map(|(date, bills)| UrgentDay {
            date: *date,
            bills: bills.iter().map(|b| BillLine::from_bill(b, as_of)).collect(),
        })
        .collect();

    RangeReport {
        start,
        end,
        busiest_days: busiest,
        heaviest_days: heaviest,
        overdue_count: context.overdue.len(),
        overdue_total: context.overdue.iter().map(|b| b.amount).sum(),
        urgent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::repository::InMemoryBillRepository;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn bill(id: &str, amount: Money, rate: f64, due: &str) -> Bill {
        Bill {
            id: id.to_string(),
            amount,
            daily_interest_rate: rate,
            due_date: date(due),
            creditor: format!("Creditor {}", id),
        }
    }

    const TODAY: &str = "2025-10-20";

    async fn handler_with(bills: Vec<Bill>, balance: Money) -> TurnHandler {
        let repo = InMemoryBillRepository::new();
        repo.insert_all("acme", bills).await;
        TurnHandler::new(
            Arc::new(repo),
            Arc::new(SessionRegistry::new(balance)),
            "acme",
        )
        .with_today(date(TODAY))
    }

    async fn turn(
        handler: &TurnHandler,
        session: Uuid,
        intent: Intent,
    ) -> (ResponseContext, ChatState) {
        handler
            .handle_turn(session, intent, TurnParams::default())
            .await
            .unwrap()
    }

    /// Leave `Start` so intent dispatch applies.
    async fn open_session(handler: &TurnHandler, session: Uuid) {
        let (context, state) = turn(handler, session, Intent::Greeting).await;
        assert!(matches!(context, ResponseContext::Welcome { .. }));
        assert_eq!(state, ChatState::MainMenu);
    }

    #[tokio::test]
    async fn test_first_turn_always_reaches_main_menu() {
        let handler = handler_with(vec![], 1000.0).await;
        let session = Uuid::new_v4();

        let (context, state) = turn(&handler, session, Intent::ViewOverdue).await;
        assert!(matches!(context, ResponseContext::Welcome { .. }));
        assert_eq!(state, ChatState::MainMenu);
    }

    #[tokio::test]
    async fn test_partial_payment_full_flow_with_requery() {
        let bills = vec![
            bill("A", 1000.0, 0.05, TODAY),
            bill("B", 1000.0, 0.001, TODAY),
        ];
        let handler = handler_with(bills, 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        // Overview suggests the partial plan (1 vs 80 vs 150).
        let (context, state) = turn(&handler, session, Intent::ViewToday).await;
        assert_eq!(state, ChatState::DayOverview);
        let ResponseContext::DayOverview(report) = context else {
            panic!("expected day overview");
        };
        assert_eq!(report.due.len(), 2);
        let suggestion = report.suggestion.unwrap();
        assert_eq!(suggestion.kind, StrategyKind::PartialPayment);
        assert!((suggestion.interest_cost - 1.0).abs() < 1e-9);

        // First pay: confirmation prompt with the cached plan.
        let (context, state) = turn(&handler, session, Intent::Pay).await;
        assert_eq!(state, ChatState::PaymentConfirmation);
        let ResponseContext::ConfirmationPrompt(prompt) = context else {
            panic!("expected confirmation prompt");
        };
        assert_eq!(prompt.kind, StrategyKind::PartialPayment);
        assert_eq!(prompt.pay_now.len(), 1);
        assert_eq!(prompt.deferred.len(), 1);

        // Second pay: commit, back to the menu.
        let (context, state) = turn(&handler, session, Intent::Pay).await;
        assert_eq!(state, ChatState::MainMenu);
        let ResponseContext::Committed(commit) = context else {
            panic!("expected commit report");
        };
        assert_eq!(commit.paid_count, 1);
        assert_eq!(commit.amount_paid, 1000.0);
        assert_eq!(commit.balance, 0.0);

        // Re-query: the settled bill is gone from list and totals.
        let (context, _) = turn(&handler, session, Intent::ViewToday).await;
        let ResponseContext::DayOverview(report) = context else {
            panic!("expected day overview");
        };
        assert_eq!(report.due.len(), 1);
        assert_eq!(report.due[0].id, "B");
        assert_eq!(report.due_total, 1000.0);
    }

    #[tokio::test]
    async fn test_duplicate_pay_after_commit_does_not_recommit() {
        let bills = vec![
            bill("A", 1000.0, 0.05, TODAY),
            bill("B", 1000.0, 0.001, TODAY),
        ];
        let handler = handler_with(bills, 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        turn(&handler, session, Intent::ViewToday).await;
        turn(&handler, session, Intent::Pay).await;
        let (_, state) = turn(&handler, session, Intent::Pay).await;
        assert_eq!(state, ChatState::MainMenu);

        let session_state = handler.sessions().get(session).await.unwrap();
        let balance_after = session_state.lock().await.balance();
        let paid_after = session_state.lock().await.paid_count();

        // A stray extra "pay" lands in the menu and changes nothing.
        let (context, state) = turn(&handler, session, Intent::Pay).await;
        assert!(matches!(context, ResponseContext::NeedQueryFirst { .. }));
        assert_eq!(state, ChatState::MainMenu);
        assert_eq!(session_state.lock().await.balance(), balance_after);
        assert_eq!(session_state.lock().await.paid_count(), paid_after);
    }

    #[tokio::test]
    async fn test_financing_flow_settles_everything() {
        // Deferring either bill for a day costs more than the 8% fee.
        let bills = vec![
            bill("A", 1000.0, 0.05, TODAY),
            bill("B", 1000.0, 0.09, TODAY),
        ];
        let handler = handler_with(bills, 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        let (context, _) = turn(&handler, session, Intent::ViewToday).await;
        let ResponseContext::DayOverview(report) = context else {
            panic!("expected day overview");
        };
        assert_eq!(
            report.suggestion.unwrap().kind,
            StrategyKind::FullFinancing(FinancingMethod::WorkingCapital)
        );

        turn(&handler, session, Intent::Pay).await;
        let (context, _) = turn(&handler, session, Intent::Pay).await;
        let ResponseContext::Committed(commit) = context else {
            panic!("expected commit report");
        };
        assert_eq!(commit.paid_count, 2);
        assert_eq!(commit.financed, 1000.0);
        assert_eq!(commit.balance, 0.0);
        assert!((commit.interest_cost - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_go_back_discards_pending_strategy() {
        let bills = vec![
            bill("A", 1000.0, 0.05, TODAY),
            bill("B", 1000.0, 0.001, TODAY),
        ];
        let handler = handler_with(bills, 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        turn(&handler, session, Intent::ViewToday).await;
        turn(&handler, session, Intent::Pay).await;

        let (context, state) = turn(&handler, session, Intent::GoBack).await;
        assert!(matches!(context, ResponseContext::ReturnedToMenu { .. }));
        assert_eq!(state, ChatState::MainMenu);

        let session_state = handler.sessions().get(session).await.unwrap();
        let guard = session_state.lock().await;
        assert_eq!(guard.balance(), 1000.0);
        assert_eq!(guard.paid_count(), 0);
        assert!(guard.pending_strategy().is_none());
    }

    #[tokio::test]
    async fn test_pay_without_context_gives_guidance() {
        let handler = handler_with(vec![], 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        let (context, state) = turn(&handler, session, Intent::Pay).await;
        assert!(matches!(context, ResponseContext::NeedQueryFirst { .. }));
        assert_eq!(state, ChatState::MainMenu);
    }

    #[tokio::test]
    async fn test_invalid_date_keeps_prompting() {
        let handler = handler_with(vec![bill("A", 100.0, 0.01, TODAY)], 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        let (context, state) = turn(&handler, session, Intent::ViewDate).await;
        assert!(matches!(context, ResponseContext::PromptDate));
        assert_eq!(state, ChatState::AwaitingDate);

        let params = TurnParams {
            raw_message: Some("the day after carnival".to_string()),
            ..TurnParams::default()
        };
        let (context, state) = handler
            .handle_turn(session, Intent::Unknown, params)
            .await
            .unwrap();
        assert!(matches!(context, ResponseContext::InvalidDate { .. }));
        assert_eq!(state, ChatState::AwaitingDate);

        let params = TurnParams {
            raw_message: Some("2025-10-20".to_string()),
            ..TurnParams::default()
        };
        let (context, state) = handler
            .handle_turn(session, Intent::Unknown, params)
            .await
            .unwrap();
        assert!(matches!(context, ResponseContext::DayOverview(_)));
        assert_eq!(state, ChatState::DayOverview);
    }

    #[tokio::test]
    async fn test_malformed_bill_aborts_pay_without_state_change() {
        let bills = vec![bill("A", 100.0, 0.01, TODAY), bill("C", -5.0, 0.01, TODAY)];
        let handler = handler_with(bills, 50.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        let (_, state) = turn(&handler, session, Intent::ViewToday).await;
        assert_eq!(state, ChatState::DayOverview);

        let result = handler
            .handle_turn(session, Intent::Pay, TurnParams::default())
            .await;
        assert!(matches!(result, Err(AgentError::MalformedBill { .. })));

        let session_state = handler.sessions().get(session).await.unwrap();
        let guard = session_state.lock().await;
        assert_eq!(guard.state(), ChatState::DayOverview);
        assert!(guard.pending_strategy().is_none());
        assert_eq!(guard.balance(), 50.0);
    }

    #[tokio::test]
    async fn test_details_and_unknown_code() {
        let bills = vec![bill("BOL001", 100.0, 0.01, TODAY)];
        let handler = handler_with(bills, 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        turn(&handler, session, Intent::ViewToday).await;

        let (context, state) = turn(&handler, session, Intent::ViewDetails).await;
        assert!(matches!(context, ResponseContext::BillList { .. }));
        assert_eq!(state, ChatState::BillDetail);

        let params = TurnParams {
            bill_id: Some("bol001".to_string()),
            ..TurnParams::default()
        };
        let (context, _) = handler
            .handle_turn(session, Intent::ViewDetails, params)
            .await
            .unwrap();
        let ResponseContext::BillDetail { bill, .. } = context else {
            panic!("expected bill detail");
        };
        assert_eq!(bill.id, "BOL001");

        let params = TurnParams {
            raw_message: Some("BOL999".to_string()),
            ..TurnParams::default()
        };
        let (context, state) = handler
            .handle_turn(session, Intent::Unknown, params)
            .await
            .unwrap();
        assert!(matches!(context, ResponseContext::UnknownBillCode { .. }));
        assert_eq!(state, ChatState::BillDetail);
    }

    #[tokio::test]
    async fn test_details_without_context_gives_guidance() {
        let handler = handler_with(vec![], 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        let (context, state) = turn(&handler, session, Intent::ViewDetails).await;
        assert!(matches!(context, ResponseContext::NeedQueryFirst { .. }));
        assert_eq!(state, ChatState::MainMenu);
    }

    #[tokio::test]
    async fn test_range_dashboard_and_highlights() {
        let bills = vec![
            bill("A", 100.0, 0.01, "2025-10-21"),
            bill("B", 200.0, 0.01, "2025-10-21"),
            bill("C", 5000.0, 0.01, "2025-10-25"),
            bill("D", 50.0, 0.01, "2025-10-17"), // overdue
        ];
        let handler = handler_with(bills, 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        let params = TurnParams {
            date: Some(date("2025-10-20")),
            end_date: Some(date("2025-10-30")),
            ..TurnParams::default()
        };
        let (context, state) = handler
            .handle_turn(session, Intent::ViewRange, params)
            .await
            .unwrap();
        assert_eq!(state, ChatState::RangeOverview);
        let ResponseContext::RangeOverview(report) = context else {
            panic!("expected range overview");
        };
        assert_eq!(report.busiest_days[0].date, date("2025-10-21"));
        assert_eq!(report.busiest_days[0].count, 2);
        assert_eq!(report.heaviest_days[0].date, date("2025-10-25"));
        assert_eq!(report.overdue_count, 1);

        let (context, _) = turn(&handler, session, Intent::ViewHighlightedValues).await;
        assert!(matches!(context, ResponseContext::HighlightedValues(_)));
    }

    #[tokio::test]
    async fn test_highlights_need_a_range_context() {
        let handler = handler_with(vec![bill("A", 100.0, 0.01, TODAY)], 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        turn(&handler, session, Intent::ViewToday).await;
        let (context, _) = turn(&handler, session, Intent::ViewHighlightedValues).await;
        assert!(matches!(
            context,
            ResponseContext::NeedQueryFirst { needed: "range" }
        ));
    }

    #[tokio::test]
    async fn test_financing_options_require_context_and_shortfall() {
        let bills = vec![bill("A", 500.0, 0.01, TODAY)];
        let handler = handler_with(bills, 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        // Balance covers the single bill: no financing needed.
        turn(&handler, session, Intent::ViewToday).await;
        let (context, _) = turn(&handler, session, Intent::ViewFinancingOptions).await;
        assert!(matches!(
            context,
            ResponseContext::FinancingUnnecessary { .. }
        ));
    }

    #[tokio::test]
    async fn test_financing_options_present_comparison() {
        let bills = vec![
            bill("A", 1000.0, 0.05, TODAY),
            bill("B", 1000.0, 0.001, TODAY),
        ];
        let handler = handler_with(bills, 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        turn(&handler, session, Intent::ViewToday).await;
        let (context, state) = turn(&handler, session, Intent::ViewFinancingOptions).await;
        assert_eq!(state, ChatState::PaymentConfirmation);
        let ResponseContext::FinancingComparison(report) = context else {
            panic!("expected comparison");
        };
        assert!((report.working_capital_cost - 80.0).abs() < 1e-9);
        assert!((report.receivables_cost - 150.0).abs() < 1e-9);
        assert!((report.partial.interest_cost - 1.0).abs() < 1e-9);
        assert_eq!(report.recommended, StrategyKind::PartialPayment);

        // Confirming executes the recommended plan.
        let (context, _) = turn(&handler, session, Intent::Pay).await;
        assert!(matches!(context, ResponseContext::Committed(_)));
    }

    #[tokio::test]
    async fn test_overdue_list_excludes_paid_bills() {
        let bills = vec![
            bill("OLD1", 300.0, 0.01, "2025-10-15"),
            bill("OLD2", 200.0, 0.01, "2025-10-10"),
        ];
        let handler = handler_with(bills, 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        let (context, state) = turn(&handler, session, Intent::ViewOverdue).await;
        assert_eq!(state, ChatState::OverdueList);
        let ResponseContext::OverdueList { bills, total } = context else {
            panic!("expected overdue list");
        };
        assert_eq!(bills.len(), 2);
        assert_eq!(total, 500.0);

        // Settle everything, then the list must come back empty.
        turn(&handler, session, Intent::Pay).await;
        turn(&handler, session, Intent::Pay).await;
        let (context, _) = turn(&handler, session, Intent::ViewOverdue).await;
        let ResponseContext::OverdueList { bills, total } = context else {
            panic!("expected overdue list");
        };
        assert!(bills.is_empty());
        assert_eq!(total, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_intent_keeps_state() {
        let handler = handler_with(vec![bill("A", 100.0, 0.01, TODAY)], 1000.0).await;
        let session = Uuid::new_v4();
        open_session(&handler, session).await;

        turn(&handler, session, Intent::ViewToday).await;
        let (context, state) = turn(&handler, session, Intent::Unknown).await;
        assert!(matches!(context, ResponseContext::Unrecognized { .. }));
        assert_eq!(state, ChatState::DayOverview);
    }
}
