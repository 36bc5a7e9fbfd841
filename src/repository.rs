//! Bill repository
//!
//! Responsible for sourcing payable bills. The core only ever reads;
//! "paid" status is session state, so the same bill fetched twice must be
//! recognizable by a stable id. Amounts and dates arrive normalized — the
//! evaluation date passed by the caller is the only source of truth for
//! "overdue", never the queried date.

use crate::models::Bill;
use crate::Result;
use chrono::NaiveDate;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for bill sourcing
#[async_trait::async_trait]
pub trait BillRepository: Send + Sync {
    async fn fetch_due_on_date(&self, company_id: &str, date: NaiveDate) -> Result<Vec<Bill>>;
    async fn fetch_overdue(&self, company_id: &str, as_of: NaiveDate) -> Result<Vec<Bill>>;
    async fn fetch_range(
        &self,
        company_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bill>>;
}

/// In-memory repository for development and tests
pub struct InMemoryBillRepository {
    bills: Arc<RwLock<Vec<(String, Bill)>>>, // (company_id, bill)
}

impl InMemoryBillRepository {
    pub fn new() -> Self {
        Self {
            bills: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn insert(&self, company_id: &str, bill: Bill) {
        let mut bills = self.bills.write().await;
        bills.push((company_id.to_string(), bill));
    }

    pub async fn insert_all(&self, company_id: &str, new_bills: Vec<Bill>) {
        let mut bills = self.bills.write().await;
        bills.extend(new_bills.into_iter().map(|b| (company_id.to_string(), b)));
    }
}

impl Default for InMemoryBillRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BillRepository for InMemoryBillRepository {
    async fn fetch_due_on_date(&self, company_id: &str, date: NaiveDate) -> Result<Vec<Bill>> {
        let bills = self.bills.read().await;
        Ok(bills
            .iter()
            .filter(|(company, bill)| company == company_id && bill.due_date == date)
            .map(|(_, bill)| bill.clone())
            .collect())
    }

    async fn fetch_overdue(&self, company_id: &str, as_of: NaiveDate) -> Result<Vec<Bill>> {
        let bills = self.bills.read().await;
        Ok(bills
            .iter()
            .filter(|(company, bill)| company == company_id && bill.due_date < as_of)
            .map(|(_, bill)| bill.clone())
            .collect())
    }

    async fn fetch_range(
        &self,
        company_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bill>> {
        let bills = self.bills.read().await;
        Ok(bills
            .iter()
            .filter(|(company, bill)| {
                company == company_id && bill.due_date >= start && bill.due_date <= end
            })
            .map(|(_, bill)| bill.clone())
            .collect())
    }
}

/// Sample data used by the demo binary and integration-style tests.
pub fn sample_bills(today: NaiveDate) -> Vec<Bill> {
    use chrono::Duration;

    vec![
        Bill {
            id: "BOL001".to_string(),
            amount: 4200.0,
            daily_interest_rate: 0.01,
            due_date: today,
            creditor: "Metro Energy".to_string(),
        },
        Bill {
            id: "BOL002".to_string(),
            amount: 1850.0,
            daily_interest_rate: 0.02,
            due_date: today,
            creditor: "Fabric Wholesale Ltd".to_string(),
        },
        Bill {
            id: "BOL003".to_string(),
            amount: 990.0,
            daily_interest_rate: 0.005,
            due_date: today - Duration::days(3),
            creditor: "City Water Works".to_string(),
        },
        Bill {
            id: "BOL004".to_string(),
            amount: 3100.0,
            daily_interest_rate: 0.015,
            due_date: today + Duration::days(4),
            creditor: "Logistics Partners".to_string(),
        },
        Bill {
            id: "BOL005".to_string(),
            amount: 760.0,
            daily_interest_rate: 0.001,
            due_date: today + Duration::days(7),
            creditor: "Office Supplies Co".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn test_fetch_due_on_date_filters_by_company_and_day() {
        let repo = InMemoryBillRepository::new();
        repo.insert_all("acme", sample_bills(date("2025-10-20"))).await;
        repo.insert(
            "other",
            Bill {
                id: "X1".to_string(),
                amount: 10.0,
                daily_interest_rate: 0.0,
                due_date: date("2025-10-20"),
                creditor: "Other Co".to_string(),
            },
        )
        .await;

        let due = repo.fetch_due_on_date("acme", date("2025-10-20")).await.unwrap();
        let ids: Vec<_> = due.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["BOL001", "BOL002"]);
    }

    #[tokio::test]
    async fn test_overdue_is_strictly_before_as_of() {
        let repo = InMemoryBillRepository::new();
        repo.insert_all("acme", sample_bills(date("2025-10-20"))).await;

        let overdue = repo.fetch_overdue("acme", date("2025-10-20")).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, "BOL003");

        // Bills due exactly on as_of are not overdue.
        let none = repo.fetch_overdue("acme", date("2025-10-17")).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_range_is_inclusive() {
        let repo = InMemoryBillRepository::new();
        repo.insert_all("acme", sample_bills(date("2025-10-20"))).await;

        let range = repo
            .fetch_range("acme", date("2025-10-20"), date("2025-10-24"))
            .await
            .unwrap();
        let ids: Vec<_> = range.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["BOL001", "BOL002", "BOL004"]);
    }
}
