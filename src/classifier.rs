//! Intent classification
//!
//! Turns a free-form user message into one of a fixed set of intents plus
//! extracted parameters (dates, a bill-id token). The state machine treats
//! every returned intent as fully confident; callers needing thresholds
//! must filter upstream.
//!
//! The bundled implementation is keyword-based and context-aware: the same
//! "yes" means nothing in the main menu but confirms a payment while the
//! session sits in the confirmation state.

use crate::fsm::ChatState;
use crate::Result;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of intents the state machine dispatches on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    ViewToday,
    ViewDate,
    ViewRange,
    ViewOverdue,
    ViewFinancingOptions,
    Pay,
    ViewDetails,
    ViewHighlightedValues,
    GoBack,
    Help,
    Unknown,
}

/// Free-form parameters extracted alongside the intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnParams {
    pub date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub bill_id: Option<String>,
    /// Original message text, kept for states that re-parse raw input
    /// (date prompts, bill-code prompts).
    pub raw_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub intent: Intent,
    pub params: TurnParams,
}

/// Collaborator seam: classification may be backed by anything from
/// keyword lists to an external model.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, message: &str, state: ChatState) -> Result<Classification>;
}

/// Static keyword lists — zero allocation
const GREETING_KEYWORDS: &[&str] = &[
    "hello", "hi there", "hey", "good morning", "good afternoon",
    "good evening", "how are you", "whats up", "what's up",
];

const VIEW_TODAY_KEYWORDS: &[&str] = &[
    "today", "due now", "this morning", "right now",
];

const VIEW_DATE_KEYWORDS: &[&str] = &[
    "another date", "specific date", "on the", "that day", "due on",
];

const VIEW_RANGE_KEYWORDS: &[&str] = &[
    "period", "range", "between", "until", "interval", "next few", "coming",
    "upcoming", "dashboard",
];

const VIEW_OVERDUE_KEYWORDS: &[&str] = &[
    "overdue", "late", "past due", "in arrears", "missed", "outstanding",
];

const FINANCING_KEYWORDS: &[&str] = &[
    "financing", "finance", "working capital", "receivables", "advance",
    "other options", "compare options", "alternatives", "credit", "loan",
    "how would that work", "negotiation",
];

const PAY_KEYWORDS: &[&str] = &[
    "pay", "settle", "execute", "go ahead", "proceed", "confirm",
    "follow your suggestion", "accept your suggestion", "apply the strategy",
    "do it", "sounds good",
];

const DETAILS_KEYWORDS: &[&str] = &[
    "details", "detail", "more info", "more information", "know more",
    "which bills", "list the bills", "show me the bills", "tell me more",
    "breakdown",
];

const HIGHLIGHTED_KEYWORDS: &[&str] = &[
    "highlighted", "highlight", "peak days", "top days", "biggest days",
    "those days", "heaviest days",
];

const GO_BACK_KEYWORDS: &[&str] = &[
    "back", "menu", "cancel", "never mind", "return", "forget it", "stop",
];

const HELP_KEYWORDS: &[&str] = &[
    "help", "what can you do", "commands", "how does this work", "lost",
];

const AFFIRMATIVE_KEYWORDS: &[&str] = &[
    "yes", "yep", "sure", "confirm", "ok", "okay", "go ahead", "pay",
    "execute", "proceed", "accept", "do it",
];

const NEGATIVE_KEYWORDS: &[&str] = &["no", "nope", "cancel", "back", "negative", "dont", "don't"];

/// Keyword-based classifier with date / range / bill-token extraction.
pub struct KeywordClassifier {
    today: NaiveDate,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self {
            today: Utc::now().date_naive(),
        }
    }

    /// Fixed reference date for relative ranges ("next 10 days"); used by
    /// tests and scripted runs.
    pub fn with_today(today: NaiveDate) -> Self {
        Self { today }
    }

    fn score(message: &str, keywords: &[&str]) -> usize {
        keywords
            .iter()
            .filter(|kw| contains_keyword(message, kw))
            .count()
    }

    /// Digit-only replies select menu entries, interpreted per state.
    fn classify_menu_digit(digit: &str, state: ChatState) -> Option<Intent> {
        let mapped = match state {
            ChatState::MainMenu => match digit {
                "1" => Intent::ViewToday,
                "2" => Intent::ViewDate,
                "3" => Intent::ViewRange,
                "4" => Intent::ViewOverdue,
                _ => return None,
            },
            ChatState::DayOverview | ChatState::OverdueList => match digit {
                "1" => Intent::Pay,
                "2" => Intent::ViewDetails,
                "3" => Intent::GoBack,
                _ => return None,
            },
            _ => return None,
        };
        Some(mapped)
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, message: &str, state: ChatState) -> Result<Classification> {
        let lowered = message.to_lowercase();
        let trimmed = lowered.trim();

        let mut params = extract_params(message);
        params.raw_message = Some(message.to_string());

        if trimmed.chars().all(|c| c.is_ascii_digit()) && !trimmed.is_empty() {
            if let Some(intent) = Self::classify_menu_digit(trimmed, state) {
                return Ok(Classification { intent, params });
            }
        }

        // Greetings win outright, same as a human receptionist.
        if Self::score(trimmed, GREETING_KEYWORDS) > 0 || trimmed == "hi" {
            return Ok(Classification {
                intent: Intent::Greeting,
                params,
            });
        }

        // Confirmation state: the message is an answer to "shall I pay?".
        if state == ChatState::PaymentConfirmation {
            if Self::score(trimmed, NEGATIVE_KEYWORDS) > 0 {
                return Ok(Classification {
                    intent: Intent::GoBack,
                    params,
                });
            }
            if Self::score(trimmed, AFFIRMATIVE_KEYWORDS) > 0 {
                return Ok(Classification {
                    intent: Intent::Pay,
                    params,
                });
            }
        }

        // After an overview, information requests outrank the pay keywords
        // ("tell me more before I pay" is not a confirmation).
        if matches!(state, ChatState::DayOverview | ChatState::BillDetail) {
            if Self::score(trimmed, FINANCING_KEYWORDS) > 0 {
                return Ok(Classification {
                    intent: Intent::ViewFinancingOptions,
                    params,
                });
            }
            if Self::score(trimmed, DETAILS_KEYWORDS) > 0 || params.bill_id.is_some() {
                return Ok(Classification {
                    intent: Intent::ViewDetails,
                    params,
                });
            }
        }

        if let Some(range) = extract_relative_range(trimmed, self.today) {
            params.date = Some(range.0);
            params.end_date = Some(range.1);
            return Ok(Classification {
                intent: Intent::ViewRange,
                params,
            });
        }

        let scored = [
            (Intent::ViewOverdue, Self::score(trimmed, VIEW_OVERDUE_KEYWORDS)),
            (
                Intent::ViewFinancingOptions,
                Self::score(trimmed, FINANCING_KEYWORDS),
            ),
            (
                Intent::ViewHighlightedValues,
                Self::score(trimmed, HIGHLIGHTED_KEYWORDS),
            ),
            (Intent::ViewRange, Self::score(trimmed, VIEW_RANGE_KEYWORDS)),
            (Intent::ViewDetails, Self::score(trimmed, DETAILS_KEYWORDS)),
            (Intent::ViewDate, Self::score(trimmed, VIEW_DATE_KEYWORDS)),
            (Intent::ViewToday, Self::score(trimmed, VIEW_TODAY_KEYWORDS)),
            (Intent::Pay, Self::score(trimmed, PAY_KEYWORDS)),
            (Intent::GoBack, Self::score(trimmed, GO_BACK_KEYWORDS)),
            (Intent::Help, Self::score(trimmed, HELP_KEYWORDS)),
        ];

        // First strictly-best score wins, so earlier entries take priority
        // on ties.
        let mut intent = Intent::Unknown;
        let mut best_score = 0;
        for (candidate, score) in scored {
            if score > best_score {
                best_score = score;
                intent = candidate;
            }
        }

        // Explicit dates refine the verdict: two dates are a range, one
        // date a single-day view.
        if params.end_date.is_some() && matches!(intent, Intent::Unknown | Intent::ViewDate | Intent::ViewToday | Intent::ViewRange)
        {
            intent = Intent::ViewRange;
        } else if params.date.is_some()
            && matches!(intent, Intent::Unknown | Intent::ViewToday | Intent::ViewDate)
        {
            intent = Intent::ViewDate;
        }

        Ok(Classification { intent, params })
    }
}

/// Multi-word keywords match as substrings; single words must match a
/// whole word so "payments" never triggers "pay".
fn contains_keyword(message: &str, keyword: &str) -> bool {
    if keyword.contains(' ') {
        message.contains(keyword)
    } else {
        message
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '\'')
            .any(|word| word == keyword)
    }
}

/// Pull ISO dates and a bill-code token out of the message.
fn extract_params(message: &str) -> TurnParams {
    let mut params = TurnParams::default();

    for token in message.split(|c: char| c.is_whitespace() || c == ',') {
        let token = token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_');
        if token.is_empty() {
            continue;
        }

        if let Ok(date) = NaiveDate::parse_from_str(token, "%Y-%m-%d") {
            if params.date.is_none() {
                params.date = Some(date);
            } else if params.end_date.is_none() {
                params.end_date = Some(date);
            }
            continue;
        }

        if params.bill_id.is_none() && looks_like_bill_code(token) {
            params.bill_id = Some(token.to_string());
        }
    }

    params
}

/// Bill codes look like "BOL001" or "bill_3": a letter prefix followed by
/// digits, possibly separated by an underscore.
fn looks_like_bill_code(token: &str) -> bool {
    let upper = token.to_uppercase();
    let has_digit = upper.chars().any(|c| c.is_ascii_digit());
    has_digit && (upper.starts_with("BOL") || upper.starts_with("BILL"))
}

/// Detect "next N days/weeks/months" and turn it into an explicit window.
fn extract_relative_range(message: &str, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let tokens: Vec<&str> = message.split_whitespace().collect();
    let next_pos = tokens.iter().position(|t| *t == "next")?;

    let count: i64 = tokens.get(next_pos + 1)?.parse().ok()?;
    let unit = tokens.get(next_pos + 2)?;

    let days = if unit.starts_with("day") {
        count
    } else if unit.starts_with("week") {
        count * 7
    } else if unit.starts_with("month") {
        count * 30
    } else {
        return None;
    };

    Some((today, today + Duration::days(days)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> KeywordClassifier {
        KeywordClassifier::with_today(NaiveDate::from_ymd_opt(2025, 10, 20).unwrap())
    }

    fn classify(message: &str, state: ChatState) -> Classification {
        classifier().classify(message, state).unwrap()
    }

    #[test]
    fn test_greetings() {
        for msg in ["hi", "hello there", "good morning!", "hey, how are you?"] {
            assert_eq!(classify(msg, ChatState::MainMenu).intent, Intent::Greeting);
        }
    }

    #[test]
    fn test_view_intents() {
        assert_eq!(
            classify("show me the payments due today", ChatState::MainMenu).intent,
            Intent::ViewToday
        );
        assert_eq!(
            classify("any overdue bills?", ChatState::MainMenu).intent,
            Intent::ViewOverdue
        );
        assert_eq!(
            classify("what financing options do I have", ChatState::MainMenu).intent,
            Intent::ViewFinancingOptions
        );
    }

    #[test]
    fn test_date_extraction_refines_intent() {
        let c = classify("bills for 2025-10-22 please", ChatState::MainMenu);
        assert_eq!(c.intent, Intent::ViewDate);
        assert_eq!(c.params.date, NaiveDate::from_ymd_opt(2025, 10, 22));

        let c = classify("2025-10-19 until 2025-10-30", ChatState::MainMenu);
        assert_eq!(c.intent, Intent::ViewRange);
        assert_eq!(c.params.end_date, NaiveDate::from_ymd_opt(2025, 10, 30));
    }

    #[test]
    fn test_relative_range() {
        let c = classify("show the next 10 days", ChatState::MainMenu);
        assert_eq!(c.intent, Intent::ViewRange);
        assert_eq!(c.params.date, NaiveDate::from_ymd_opt(2025, 10, 20));
        assert_eq!(c.params.end_date, NaiveDate::from_ymd_opt(2025, 10, 30));
    }

    #[test]
    fn test_confirmation_state_yes_no() {
        assert_eq!(
            classify("yes, go ahead", ChatState::PaymentConfirmation).intent,
            Intent::Pay
        );
        assert_eq!(
            classify("no, cancel that", ChatState::PaymentConfirmation).intent,
            Intent::GoBack
        );
    }

    #[test]
    fn test_details_outrank_pay_after_overview() {
        let c = classify(
            "tell me more about these bills before I pay",
            ChatState::DayOverview,
        );
        assert_eq!(c.intent, Intent::ViewDetails);
    }

    #[test]
    fn test_bill_code_token() {
        let c = classify("show BOL002 details", ChatState::DayOverview);
        assert_eq!(c.intent, Intent::ViewDetails);
        assert_eq!(c.params.bill_id.as_deref(), Some("BOL002"));
    }

    #[test]
    fn test_menu_digits() {
        assert_eq!(classify("1", ChatState::MainMenu).intent, Intent::ViewToday);
        assert_eq!(classify("1", ChatState::DayOverview).intent, Intent::Pay);
        assert_eq!(classify("3", ChatState::DayOverview).intent, Intent::GoBack);
    }

    #[test]
    fn test_unknown() {
        assert_eq!(
            classify("purple elephants", ChatState::MainMenu).intent,
            Intent::Unknown
        );
    }
}
