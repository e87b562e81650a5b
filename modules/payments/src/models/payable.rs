use serde::{Deserialize, Serialize};

use super::UnknownVariant;

/// Domain object a payment is collected on behalf of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Payable {
    PostPurchase(i64),
    Tip(i64),
    Membership(i64),
    SubscriptionCharge(i64),
    AdSpend(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayableKind {
    PostPurchase,
    Tip,
    Membership,
    SubscriptionCharge,
    AdSpend,
}

impl PayableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayableKind::PostPurchase => "post_purchase",
            PayableKind::Tip => "tip",
            PayableKind::Membership => "membership",
            PayableKind::SubscriptionCharge => "subscription_charge",
            PayableKind::AdSpend => "ad_spend",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "post_purchase" => Ok(PayableKind::PostPurchase),
            "tip" => Ok(PayableKind::Tip),
            "membership" => Ok(PayableKind::Membership),
            "subscription_charge" => Ok(PayableKind::SubscriptionCharge),
            "ad_spend" => Ok(PayableKind::AdSpend),
            other => Err(UnknownVariant::new("payable kind", other)),
        }
    }
}

impl Payable {
    pub fn kind(&self) -> PayableKind {
        match self {
            Payable::PostPurchase(_) => PayableKind::PostPurchase,
            Payable::Tip(_) => PayableKind::Tip,
            Payable::Membership(_) => PayableKind::Membership,
            Payable::SubscriptionCharge(_) => PayableKind::SubscriptionCharge,
            Payable::AdSpend(_) => PayableKind::AdSpend,
        }
    }

    pub fn id(&self) -> i64 {
        match *self {
            Payable::PostPurchase(id)
            | Payable::Tip(id)
            | Payable::Membership(id)
            | Payable::SubscriptionCharge(id)
            | Payable::AdSpend(id) => id,
        }
    }

    /// Rebuild from the stored `(kind, id)` pair.
    pub fn from_parts(kind: &str, id: i64) -> Result<Self, UnknownVariant> {
        Ok(match PayableKind::from_str(kind)? {
            PayableKind::PostPurchase => Payable::PostPurchase(id),
            PayableKind::Tip => Payable::Tip(id),
            PayableKind::Membership => Payable::Membership(id),
            PayableKind::SubscriptionCharge => Payable::SubscriptionCharge(id),
            PayableKind::AdSpend => Payable::AdSpend(id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_round_trip_every_kind() {
        let all = [
            Payable::PostPurchase(1),
            Payable::Tip(2),
            Payable::Membership(3),
            Payable::SubscriptionCharge(4),
            Payable::AdSpend(5),
        ];
        for payable in all {
            let rebuilt = Payable::from_parts(payable.kind().as_str(), payable.id()).unwrap();
            assert_eq!(rebuilt, payable);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Payable::from_parts("App\\Models\\Story", 1).unwrap_err();
        assert_eq!(err.kind, "payable kind");
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(Payable::Tip(9)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "tip", "id": 9}));
    }
}
