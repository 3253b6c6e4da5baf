use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Employee,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Employee => "employee",
            Role::Member => "member",
        }
    }

    /// Staff may cancel any invoice regardless of owner.
    pub fn can_cancel_any(&self) -> bool {
        matches!(self, Role::Admin | Role::Employee)
    }

    pub fn can_manage_schedule(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "employee" => Ok(Role::Employee),
            "member" => Ok(Role::Member),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub role: Role,
    pub score: i64,
    /// Share of the paid total credited back as loyalty score.
    pub rank_percent: i32,
}

/// Identity of whoever is driving the current request, resolved once at the edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub account_id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(account_id: impl Into<String>, role: Role) -> Self {
        Self { account_id: account_id.into(), role }
    }

    pub fn member(account_id: impl Into<String>) -> Self {
        Self::new(account_id, Role::Member)
    }

    pub fn admin(account_id: impl Into<String>) -> Self {
        Self::new(account_id, Role::Admin)
    }
}
