use serde::{Deserialize, Serialize};
use std::fmt;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

typed_id!(EntityId);
typed_id!(MemberId);
typed_id!(ExpenseId);

/// A record a mutation can target.
///
/// The coordinator only ever reads these; changes happen on the backend and
/// come back through a refreshed collection.
pub trait Entity: Send + Sync + 'static {
    fn id(&self) -> EntityId;
    fn display_name(&self) -> String;
}

/// A tenant record as listed in the console.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Member {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: MemberId::new(id),
            name: name.into(),
            room: None,
            active: true,
        }
    }

    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }
}

impl Entity for Member {
    fn id(&self) -> EntityId {
        EntityId(self.id.0.clone())
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    RecordPayment,
    AddExpense,
    EditExpense,
    Deactivate,
    Reactivate,
    Delete,
}

impl OperationKind {
    pub const ALL: [Self; 6] = [
        Self::RecordPayment,
        Self::AddExpense,
        Self::EditExpense,
        Self::Deactivate,
        Self::Reactivate,
        Self::Delete,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RecordPayment => "record_payment",
            Self::AddExpense => "add_expense",
            Self::EditExpense => "edit_expense",
            Self::Deactivate => "deactivate",
            Self::Reactivate => "reactivate",
            Self::Delete => "delete",
        }
    }

    /// Verb used in outcome notices, e.g. "Payment recorded for Ana".
    #[must_use]
    pub const fn success_phrase(self) -> &'static str {
        match self {
            Self::RecordPayment => "Payment recorded",
            Self::AddExpense => "Expense added",
            Self::EditExpense => "Expense updated",
            Self::Deactivate => "Member deactivated",
            Self::Reactivate => "Member reactivated",
            Self::Delete => "Member deleted",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an expense entry. Amounts are in minor currency units.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseItem {
    pub label: String,
    pub amount_cents: i64,
}

impl ExpenseItem {
    pub fn new(label: impl Into<String>, amount_cents: i64) -> Self {
        Self {
            label: label.into(),
            amount_cents,
        }
    }
}

/// The exact values a user submitted for an operation.
///
/// Kept verbatim in the error cache when the remote call fails so the form can
/// be re-populated with them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum MutationInput {
    RecordPayment {
        amount_cents: i64,
        #[serde(default)]
        note: Option<String>,
    },
    AddExpense {
        items: Vec<ExpenseItem>,
    },
    EditExpense {
        expense_id: ExpenseId,
        items: Vec<ExpenseItem>,
    },
    Deactivate {
        #[serde(default)]
        reason: Option<String>,
    },
    Reactivate,
    Delete,
}

impl MutationInput {
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::RecordPayment { .. } => OperationKind::RecordPayment,
            Self::AddExpense { .. } => OperationKind::AddExpense,
            Self::EditExpense { .. } => OperationKind::EditExpense,
            Self::Deactivate { .. } => OperationKind::Deactivate,
            Self::Reactivate => OperationKind::Reactivate,
            Self::Delete => OperationKind::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod member_tests {
        use super::*;

        #[test]
        fn test_member_exposes_entity_identity() {
            let member = Member::new("m1", "Ana").with_room("2B");
            assert_eq!(member.id(), EntityId::new("m1"));
            assert_eq!(member.display_name(), "Ana");
            assert_eq!(member.room.as_deref(), Some("2B"));
        }

        #[test]
        fn test_member_defaults_to_active_when_field_missing() {
            let member: Member = serde_json::from_str(r#"{"id":"m1","name":"Ana"}"#).unwrap();
            assert!(member.active);
            assert!(member.room.is_none());
        }
    }

    mod operation_tests {
        use super::*;

        #[test]
        fn test_operation_kind_wire_names() {
            for kind in OperationKind::ALL {
                let json = serde_json::to_string(&kind).unwrap();
                assert_eq!(json, format!("\"{}\"", kind.as_str()));
            }
        }

        #[test]
        fn test_input_kind_matches_variant() {
            let payment = MutationInput::RecordPayment {
                amount_cents: 150_000,
                note: None,
            };
            assert_eq!(payment.kind(), OperationKind::RecordPayment);
            assert_eq!(MutationInput::Delete.kind(), OperationKind::Delete);
            assert_eq!(
                MutationInput::EditExpense {
                    expense_id: ExpenseId::new("e1"),
                    items: vec![],
                }
                .kind(),
                OperationKind::EditExpense
            );
        }

        #[test]
        fn test_input_is_tagged_by_operation() {
            let input = MutationInput::AddExpense {
                items: vec![ExpenseItem::new("Electricity", 42_500)],
            };
            let json = serde_json::to_value(&input).unwrap();
            assert_eq!(json["operation"], "add_expense");
            assert_eq!(json["items"][0]["amountCents"], 42_500);
        }
    }
}
