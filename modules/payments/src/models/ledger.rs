use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Metadata, UnknownVariant};
use crate::money::Money;

/// Logical book every entry of this core is written to
pub const PAYMENTS_LEDGER: &str = "payments";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "credit" => Ok(Direction::Credit),
            "debit" => Ok(Direction::Debit),
            other => Err(UnknownVariant::new("ledger direction", other)),
        }
    }
}

/// Account owner an entry is booked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Ledgerable {
    User(i64),
}

impl Ledgerable {
    pub fn kind(&self) -> &'static str {
        match self {
            Ledgerable::User(_) => "user",
        }
    }

    pub fn id(&self) -> i64 {
        match *self {
            Ledgerable::User(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Result<Self, UnknownVariant> {
        match kind {
            "user" => Ok(Ledgerable::User(id)),
            other => Err(UnknownVariant::new("ledgerable kind", other)),
        }
    }
}

/// One side of a double-entry posting. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub ledger: String,
    pub ledgerable: Ledgerable,
    pub payment_id: Uuid,
    /// Set for refund reversals; capture postings leave it empty
    pub refund_id: Option<Uuid>,
    pub direction: Direction,
    pub amount: Money,
    pub balance_after: Option<i64>,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}
