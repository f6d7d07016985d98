use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::money::Money;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(UserId);
id_type!(AccountId);
id_type!(CategoryId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Checking,
    Savings,
    Credit,
    Cash,
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountKind::Checking => write!(f, "checking"),
            AccountKind::Savings => write!(f, "savings"),
            AccountKind::Credit => write!(f, "credit"),
            AccountKind::Cash => write!(f, "cash"),
        }
    }
}

impl std::str::FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checking" => Ok(AccountKind::Checking),
            "savings" => Ok(AccountKind::Savings),
            "credit" => Ok(AccountKind::Credit),
            "cash" => Ok(AccountKind::Cash),
            other => Err(format!("Unknown account kind: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub name: String,
    pub kind: AccountKind,
    pub balance: Money,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A budget envelope. `activity` is the running total moved through it this period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub user_id: UserId,
    pub name: String,
    pub assigned: Money,
    pub activity: Money,
    pub is_hidden: bool,
}

impl Category {
    pub fn available(&self) -> Money {
        self.assigned - self.activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn account_kind_roundtrip() {
        for kind in [
            AccountKind::Checking,
            AccountKind::Savings,
            AccountKind::Credit,
            AccountKind::Cash,
        ] {
            assert_eq!(AccountKind::from_str(&kind.to_string()).unwrap(), kind);
        }
        assert!(AccountKind::from_str("brokerage").is_err());
    }

    #[test]
    fn category_available_is_assigned_minus_activity() {
        let cat = Category {
            id: CategoryId(1),
            user_id: UserId(1),
            name: "Shopping".into(),
            assigned: Money::from_cents(100_000),
            activity: Money::from_cents(25_000),
            is_hidden: false,
        };
        assert_eq!(cat.available(), Money::from_cents(75_000));
    }

    #[test]
    fn ids_serialize_transparently() {
        assert_eq!(serde_json::to_string(&AccountId(7)).unwrap(), "7");
    }
}
