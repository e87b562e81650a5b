use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Metadata, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    Grace,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Grace => "grace",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "grace" => Ok(SubscriptionStatus::Grace),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(UnknownVariant::new("subscription status", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled | SubscriptionStatus::Expired)
    }

    /// Inside a paid or trial period
    pub fn is_in_period(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

/// Reminder bookkeeping keys kept in subscription metadata
pub const REMINDER_SENT_AT_KEY: &str = "last_renewal_reminder_sent_at";
pub const REMINDER_PERIOD_END_KEY: &str = "last_renewal_reminder_period_end";
pub const REMINDER_GRACE_KEY: &str = "last_renewal_reminder_grace";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSubscription {
    pub id: Uuid,
    pub uuid: Uuid,
    pub subscriber_id: i64,
    pub creator_id: i64,
    pub plan_ref: String,
    pub status: SubscriptionStatus,
    pub auto_renews: bool,
    pub ends_at: DateTime<Utc>,
    /// Only meaningful while `status == Grace`
    pub grace_ends_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl PaymentSubscription {
    /// Due for the expiry sweep at `now`
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing => self.ends_at <= now,
            SubscriptionStatus::Grace => self.grace_ends_at.is_some_and(|at| at <= now),
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => false,
        }
    }

    /// The period boundary a renewal reminder refers to, and whether it is a
    /// grace-period reminder. `None` when no reminder applies.
    pub fn reminder_boundary(&self) -> Option<(DateTime<Utc>, bool)> {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trialing if self.auto_renews => {
                Some((self.ends_at, false))
            }
            SubscriptionStatus::Grace => self.grace_ends_at.map(|at| (at, true)),
            _ => None,
        }
    }

    pub fn last_reminded_period_end(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(REMINDER_PERIOD_END_KEY)
            .and_then(|v| v.as_str())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
    }

    /// Boundary still owed a reminder: inside `(now, until]` and not yet
    /// reminded for.
    pub fn pending_reminder(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, bool)> {
        self.reminder_boundary()
            .filter(|(at, _)| *at > now && *at <= until)
            .filter(|(at, _)| self.last_reminded_period_end() != Some(*at))
    }
}
