use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Invoice lifecycle. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Incomplete,
    Completed,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Incomplete => "incomplete",
            InvoiceStatus::Completed => "completed",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        matches!(
            (self, next),
            (InvoiceStatus::Incomplete, InvoiceStatus::Completed)
                | (InvoiceStatus::Incomplete, InvoiceStatus::Cancelled)
                | (InvoiceStatus::Completed, InvoiceStatus::Cancelled)
        )
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(InvoiceStatus::Incomplete),
            "completed" => Ok(InvoiceStatus::Completed),
            "cancelled" => Ok(InvoiceStatus::Cancelled),
            other => Err(format!("unknown invoice status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoodLine {
    pub food_id: i64,
    pub quantity: i32,
    pub price: i64,
}

impl FoodLine {
    pub const MAX_QUANTITY: i32 = 20;
    pub const MAX_PRICE: i64 = 10_000_000;

    /// Whether quantity and unit price fall inside what the concession stand sells.
    pub fn is_orderable(&self) -> bool {
        (1..=Self::MAX_QUANTITY).contains(&self.quantity) && (1..=Self::MAX_PRICE).contains(&self.price)
    }

    /// `None` on overflow.
    pub fn subtotal(&self) -> Option<i64> {
        self.price.checked_mul(i64::from(self.quantity))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub account_id: String,
    pub movie_show_id: i64,
    pub seat_ids: Vec<i64>,
    pub seat_labels: String,
    pub total_price: i64,
    pub status: InvoiceStatus,
    pub cancel: bool,
    pub voucher_id: Option<String>,
    pub used_score: i64,
    pub earned_score: i64,
    pub food_lines: Vec<FoodLine>,
    pub booking_date: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub payment_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub id: String,
    pub account_id: String,
    pub value: i64,
    pub is_used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub invoice_id: String,
    pub amount: i64,
    pub voucher_restored: bool,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}
