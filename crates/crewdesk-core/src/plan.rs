//! The dependency-ordered restore plan.
//!
//! Departments and staff reference each other (a department's manager is a staff
//! row; a staff row belongs to a department), so departments are written twice:
//! once with the manager link cleared before staff exist, and once afterwards to
//! restore it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{TableName, AUTH_LINK_FIELD, DEPARTMENT_MANAGER_FIELD};
use crate::Record;

/// The identity performing a restore.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub email: String,
    /// Authentication identity to bind to the actor's own staff row.
    pub auth_id: Option<String>,
    pub label: String,
}

impl Actor {
    #[must_use]
    pub fn new(email: impl Into<String>, auth_id: Option<String>) -> Self {
        let email = email.into();
        Self { label: email.clone(), email, auth_id }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn owns(&self, row: &Record) -> bool {
        row.get("email")
            .and_then(Value::as_str)
            .is_some_and(|email| email.trim().eq_ignore_ascii_case(self.email.trim()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Reference,
    DepartmentsUnlinked,
    Staff,
    DepartmentsLinked,
    DepartmentSettings,
    Rosters,
    Operational,
    Lifecycle,
}

impl Phase {
    pub const ORDER: [Self; 8] = [
        Self::Reference,
        Self::DepartmentsUnlinked,
        Self::Staff,
        Self::DepartmentsLinked,
        Self::DepartmentSettings,
        Self::Rosters,
        Self::Operational,
        Self::Lifecycle,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::DepartmentsUnlinked => "departments_unlinked",
            Self::Staff => "staff",
            Self::DepartmentsLinked => "departments_linked",
            Self::DepartmentSettings => "department_settings",
            Self::Rosters => "rosters",
            Self::Operational => "operational",
            Self::Lifecycle => "lifecycle",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Reference => "reference tables",
            Self::DepartmentsUnlinked => "departments (manager links cleared)",
            Self::Staff => "staff",
            Self::DepartmentsLinked => "department manager links",
            Self::DepartmentSettings => "department settings",
            Self::Rosters => "rosters",
            Self::Operational => "operational records",
            Self::Lifecycle => "HR and lifecycle records",
        }
    }

    #[must_use]
    pub fn tables(self) -> &'static [TableName] {
        use TableName as T;
        match self {
            Self::Reference => &[
                T::Roles,
                T::LeaveTypes,
                T::Holidays,
                T::CustomFieldDefinitions,
                T::ValidationRuleSets,
                T::RosterViewTemplates,
                T::ChecklistTemplates,
                T::QualificationTypes,
                T::AircraftTypes,
                T::LicenseTypes,
                T::SpecialQualifications,
            ],
            Self::DepartmentsUnlinked | Self::DepartmentsLinked => &[T::Departments],
            Self::Staff => &[T::Staff],
            Self::DepartmentSettings => &[T::DepartmentSettings],
            Self::Rosters => &[T::Rosters, T::RosterMetadata],
            Self::Operational => &[
                T::FlightLogs,
                T::FlightHourAdjustments,
                T::LeaveRequests,
                T::LeaveTransactions,
                T::NoticeDocuments,
                T::NoticeAcknowledgments,
                T::Questions,
                T::Exams,
                T::ExamAttempts,
                T::SwapRequests,
            ],
            Self::Lifecycle => &[
                T::Goals,
                T::PerformanceTemplates,
                T::PerformanceReviews,
                T::CateringMenus,
                T::CateringOrders,
            ],
        }
    }

    /// Progress percentage reported once the phase completes.
    #[must_use]
    pub fn checkpoint(self) -> u8 {
        match self {
            Self::Reference => 20,
            Self::DepartmentsUnlinked => 30,
            Self::Staff => 45,
            Self::DepartmentsLinked => 50,
            Self::DepartmentSettings => 55,
            Self::Rosters => 65,
            Self::Operational => 85,
            Self::Lifecycle => 95,
        }
    }

    /// Whether `table` is written again by a phase after this one.
    #[must_use]
    pub fn revisited_later(self, table: TableName) -> bool {
        Self::ORDER.into_iter().any(|later| later > self && later.tables().contains(&table))
    }

    /// Shape sanitized rows for this phase's upsert.
    ///
    /// The linked department pass resends full rows, since a store may validate the
    /// proposed insert before resolving the conflict. Rows without an id or a
    /// manager are dropped from it: the unlinked pass already wrote them as-is.
    #[must_use]
    pub fn prepare(self, rows: Vec<Record>, actor: &Actor) -> Vec<Record> {
        match self {
            Self::DepartmentsUnlinked => rows
                .into_iter()
                .map(|mut row| {
                    row.insert(DEPARTMENT_MANAGER_FIELD.to_string(), Value::Null);
                    row
                })
                .collect(),
            Self::DepartmentsLinked => rows
                .into_iter()
                .filter(|row| {
                    let linked = |field: &str| row.get(field).is_some_and(|value| !value.is_null());
                    linked("id") && linked(DEPARTMENT_MANAGER_FIELD)
                })
                .collect(),
            Self::Staff => rows
                .into_iter()
                .map(|mut row| {
                    let binding = if actor.owns(&row) {
                        actor.auth_id.clone().map_or(Value::Null, Value::String)
                    } else {
                        Value::Null
                    };
                    row.insert(AUTH_LINK_FIELD.to_string(), binding);
                    row
                })
                .collect(),
            _ => rows,
        }
    }
}
