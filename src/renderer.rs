//! Response rendering
//!
//! Turns the state machine's structured payloads into user-facing text.
//! The template renderer is deterministic and always available; the LLM
//! renderer rephrases the same payload and falls back to the template on
//! any API failure, so rendering can never corrupt a committed turn.

use crate::fsm::{
    BillLine, CommitReport, ComparisonReport, ConfirmationReport, OverviewReport, RangeReport,
    ResponseContext,
};
use crate::llm::GeminiClient;
use crate::models::StrategyKind;
use crate::Result;
use tracing::warn;

/// Collaborator seam for prose generation.
#[async_trait::async_trait]
pub trait ResponseRenderer: Send + Sync {
    async fn render(&self, context: &ResponseContext) -> Result<String>;
}

//
// ================= Template Renderer =================
//

/// Deterministic renderer; also serves as the fallback for the LLM one.
pub struct TemplateRenderer;

fn money(value: f64) -> String {
    format!("${:.2}", value)
}

fn bill_lines(bills: &[BillLine]) -> String {
    bills
        .iter()
        .map(|b| {
            let marker = if b.overdue { " (overdue)" } else { "" };
            format!(
                "  - {}: {} — {}, due {}{}",
                b.id,
                b.creditor,
                money(b.amount),
                b.due_date,
                marker
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn suggestion_text(report: &OverviewReport) -> String {
    let Some(suggestion) = &report.suggestion else {
        return String::new();
    };

    match suggestion.kind {
        StrategyKind::FullBalance => "\n\nSuggestion: your balance covers everything. \
             I recommend paying all bills now to avoid interest. Say \"pay\" to execute."
            .to_string(),
        StrategyKind::FullFinancing(method) => format!(
            "\n\nSuggestion: cover the {} shortfall with {}. Financing cost: {}. \
             Say \"pay\" to execute, or ask for financing options.",
            money(suggestion.deficit),
            method,
            money(suggestion.interest_cost)
        ),
        StrategyKind::PartialPayment => format!(
            "\n\nSuggestion: smart partial payment — settle {} now and leave {} for \
             tomorrow's receipts. One day of interest costs only {}. Say \"pay\" to \
             execute, or ask for financing options.",
            money(suggestion.pay_now_total),
            money(suggestion.deferred_total),
            money(suggestion.interest_cost)
        ),
    }
}

fn overview_text(report: &OverviewReport) -> String {
    let mut out = format!(
        "Payments for {}: {} bill(s) due totalling {}.",
        report.date,
        report.due.len(),
        money(report.due_total)
    );
    if !report.due.is_empty() {
        out.push('\n');
        out.push_str(&bill_lines(&report.due));
    }
    if !report.overdue.is_empty() {
        out.push_str(&format!(
            "\nOverdue: {} bill(s) totalling {}.\n{}",
            report.overdue.len(),
            money(report.overdue_total),
            bill_lines(&report.overdue)
        ));
    }
    out.push_str(&format!("\nAvailable balance: {}.", money(report.balance)));
    out.push_str(&suggestion_text(report));
    out
}

fn range_text(report: &RangeReport) -> String {
    let mut out = format!("Overview for {} until {}.\n", report.start, report.end);

    if !report.busiest_days.is_empty() {
        out.push_str("Days with most bills:\n");
        for day in &report.busiest_days {
            out.push_str(&format!("  - {}: {} bill(s)\n", day.date, day.count));
        }
    }
    if !report.heaviest_days.is_empty() {
        out.push_str("Days with highest totals:\n");
        for day in &report.heaviest_days {
            out.push_str(&format!("  - {}: {}\n", day.date, money(day.total)));
        }
    }
    out.push_str(&format!(
        "Overdue: {} bill(s) totalling {}.\n",
        report.overdue_count,
        money(report.overdue_total)
    ));
    if !report.urgent.is_empty() {
        out.push_str("Most urgent days:\n");
        for day in &report.urgent {
            let total: f64 = day.bills.iter().map(|b| b.amount).sum();
            out.push_str(&format!(
                "  - {}: {} bill(s) — {}\n",
                day.date,
                day.bills.len(),
                money(total)
            ));
        }
    }
    out.trim_end().to_string()
}

fn comparison_text(report: &ComparisonReport) -> String {
    format!(
        "Financing comparison for a {} shortfall (total due {}, balance {}):\n\
         \n\
         Option 1 — Working Capital (8%): cost {}, total repayment {}.\n\
         Option 2 — Receivables Advance (15%): cost {}, total repayment {}.\n\
         Option 3 — Smart partial payment: pay {} now, defer {}; one day of \
         interest costs {} (saves {} vs. financing the whole deficit).\n\
         \n\
         Recommended: {}. Say \"pay\" to execute it or \"back\" to cancel.",
        money(report.deficit),
        money(report.total_due),
        money(report.balance),
        money(report.working_capital_cost),
        money(report.working_capital_outlay),
        money(report.receivables_cost),
        money(report.receivables_outlay),
        money(report.partial.pay_now_total),
        money(report.partial.deferred_total),
        money(report.partial.interest_cost),
        money(report.partial.savings),
        report.recommended
    )
}

fn confirmation_text(report: &ConfirmationReport) -> String {
    let mut out = format!(
        "Payment confirmation — {}.\n\
         Paying now: {} bill(s) totalling {}.",
        report.kind,
        report.pay_now.len(),
        money(report.pay_now_total)
    );
    if !report.pay_now.is_empty() {
        out.push('\n');
        out.push_str(&bill_lines(&report.pay_now));
    }
    if !report.deferred.is_empty() {
        out.push_str(&format!(
            "\nDeferred to tomorrow: {} bill(s) totalling {} (one day of interest: {}).",
            report.deferred.len(),
            money(report.deferred_total),
            money(report.interest_cost)
        ));
    }
    if report.financed > 0.0 {
        out.push_str(&format!(
            "\nCredit drawn to fill the gap: {} (fee {}).",
            money(report.financed),
            money(report.interest_cost)
        ));
    }
    out.push_str(&format!(
        "\nBalance: {} now, {} after payment.\n\
         Confirm? (\"pay\" to confirm, \"back\" to cancel)",
        money(report.balance),
        money(report.balance_after)
    ));
    out
}

fn commit_text(report: &CommitReport) -> String {
    let mut out = format!(
        "Payment executed — {}.\n\
         Settled {} bill(s) for {}.",
        report.kind,
        report.paid_count,
        money(report.amount_paid)
    );
    if report.financed > 0.0 {
        out.push_str(&format!(
            "\nFinanced {} at a cost of {}.",
            money(report.financed),
            money(report.interest_cost)
        ));
    }
    if !report.deferred.is_empty() {
        let deferred_total: f64 = report.deferred.iter().map(|b| b.amount).sum();
        out.push_str(&format!(
            "\nLeft for tomorrow's receipts: {} bill(s) totalling {}.",
            report.deferred.len(),
            money(deferred_total)
        ));
    }
    out.push_str(&format!(
        "\nNew balance: {}. Anything else?",
        money(report.balance)
    ));
    out
}

impl TemplateRenderer {
    pub fn render_text(context: &ResponseContext) -> String {
        match context {
            ResponseContext::Welcome { balance, overview } => {
                let mut out = format!(
                    "Hello! I'm your payment assistant. Your current balance is {}.",
                    money(*balance)
                );
                match overview {
                    Some(report) => {
                        out.push_str("\n\n");
                        out.push_str(&overview_text(report));
                    }
                    None => out.push_str(
                        "\nYou can ask for today's payments, another date, a period, \
                         or overdue bills.",
                    ),
                }
                out
            }
            ResponseContext::DayOverview(report) => overview_text(report),
            ResponseContext::RangeOverview(report) => range_text(report),
            ResponseContext::HighlightedValues(report) => range_text(report),
            ResponseContext::OverdueList { bills, total } => {
                if bills.is_empty() {
                    "No overdue bills — everything is up to date.".to_string()
                } else {
                    format!(
                        "You have {} overdue bill(s) totalling {}:\n{}",
                        bills.len(),
                        money(*total),
                        bill_lines(bills)
                    )
                }
            }
            ResponseContext::BillList {
                bills,
                total,
                balance,
            } => format!(
                "Outstanding bills ({} totalling {}, balance {}):\n{}\n\
                 Give me a bill code for full details, or say \"pay\".",
                bills.len(),
                money(*total),
                money(*balance),
                bill_lines(bills)
            ),
            ResponseContext::BillDetail {
                bill,
                accrued_interest,
            } => {
                let mut out = format!(
                    "Bill {} — {}.\nAmount: {}. Due date: {}.",
                    bill.id,
                    bill.creditor,
                    money(bill.amount),
                    bill.due_date
                );
                if bill.overdue {
                    out.push_str(&format!(
                        "\nThis bill is OVERDUE; accrued interest so far: {}.",
                        money(*accrued_interest)
                    ));
                }
                out.push_str("\nPay this one along with the rest by saying \"pay\".");
                out
            }
            ResponseContext::FinancingComparison(report) => comparison_text(report),
            ResponseContext::ConfirmationPrompt(report) => confirmation_text(report),
            ResponseContext::Committed(report) => commit_text(report),
            ResponseContext::NothingToPay { balance } => format!(
                "Good news — there is nothing left to pay. Balance: {}.",
                money(*balance)
            ),
            ResponseContext::FinancingUnnecessary { total_due, balance } => format!(
                "Your balance of {} covers the {} due; no financing needed. \
                 Just say \"pay\" after an overview to settle everything.",
                money(*balance),
                money(*total_due)
            ),
            ResponseContext::PromptDate => {
                "Which date would you like to check? Use the format YYYY-MM-DD \
                 (e.g. 2025-10-20)."
                    .to_string()
            }
            ResponseContext::PromptRange => {
                "Which period? Give me two dates, e.g. 2025-10-19 until 2025-10-30."
                    .to_string()
            }
            ResponseContext::InvalidDate { input } => format!(
                "I couldn't read \"{}\" as a date. Please use YYYY-MM-DD.",
                input
            ),
            ResponseContext::InvalidRange { input } => format!(
                "I couldn't read \"{}\" as a period. Please give two dates like \
                 2025-10-19 until 2025-10-30.",
                input
            ),
            ResponseContext::UnknownBillCode { token } => format!(
                "I couldn't find a bill matching \"{}\". Want the full list?",
                token
            ),
            ResponseContext::NeedQueryFirst { needed } => match *needed {
                "range" => "To see highlighted values, first ask for a period overview."
                    .to_string(),
                _ => "First check today's payments, a specific date, or the overdue \
                      list — then I can act on them."
                    .to_string(),
            },
            ResponseContext::ReturnedToMenu { balance } => format!(
                "Back to the main menu. Balance: {}. What would you like to see?",
                money(*balance)
            ),
            ResponseContext::Help {
                balance,
                paid_count,
            } => format!(
                "You can ask me things like:\n\
                   - \"show today's payments\"\n\
                   - \"bills for 2025-10-22\"\n\
                   - \"next 10 days\"\n\
                   - \"overdue bills\"\n\
                   - \"financing options\"\n\
                   - \"pay\" / \"back\"\n\
                 Current balance: {}. Bills paid this session: {}.",
                money(*balance),
                paid_count
            ),
            ResponseContext::Unrecognized { balance } => format!(
                "Sorry, I didn't get that. You can ask for today's payments, a date, \
                 a period, overdue bills, or say \"pay\". Balance: {}.",
                money(*balance)
            ),
        }
    }
}

#[async_trait::async_trait]
impl ResponseRenderer for TemplateRenderer {
    async fn render(&self, context: &ResponseContext) -> Result<String> {
        Ok(Self::render_text(context))
    }
}

//
// ================= LLM Renderer =================
//

/// Rephrases payloads through Gemini; any failure degrades to the
/// deterministic template, never to an error.
pub struct LlmRenderer {
    client: GeminiClient,
}

impl LlmRenderer {
    pub fn new(api_key: String) -> Self {
        Self {
            client: GeminiClient::new(api_key),
        }
    }
}

#[async_trait::async_trait]
impl ResponseRenderer for LlmRenderer {
    async fn render(&self, context: &ResponseContext) -> Result<String> {
        let payload = serde_json::to_string(context)?;

        match self.client.phrase(&payload).await {
            Ok((text, _confidence)) => Ok(text),
            Err(error) => {
                warn!(%error, "LLM rendering failed, using template");
                Ok(TemplateRenderer::render_text(context))
            }
        }
    }
}
