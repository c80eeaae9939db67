//! Static catalog of every table a snapshot carries.
//!
//! Relationships between tables are plain identifier strings in the payload, so the
//! catalog is where they are made explicit: each [`TableDescriptor`] lists the fields
//! holding identifiers of reconciled tables, alongside the restore-time migrations
//! and validity checks for its rows.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Roles,
    LeaveTypes,
    Holidays,
    CustomFieldDefinitions,
    ValidationRuleSets,
    RosterViewTemplates,
    ChecklistTemplates,
    QualificationTypes,
    AircraftTypes,
    LicenseTypes,
    SpecialQualifications,
    Departments,
    Staff,
    DepartmentSettings,
    Rosters,
    RosterMetadata,
    FlightLogs,
    FlightHourAdjustments,
    LeaveRequests,
    LeaveTransactions,
    NoticeDocuments,
    NoticeAcknowledgments,
    Questions,
    Exams,
    ExamAttempts,
    SwapRequests,
    Goals,
    PerformanceTemplates,
    PerformanceReviews,
    CateringMenus,
    CateringOrders,
}

impl TableName {
    pub const ALL: [Self; 31] = [
        Self::Roles,
        Self::LeaveTypes,
        Self::Holidays,
        Self::CustomFieldDefinitions,
        Self::ValidationRuleSets,
        Self::RosterViewTemplates,
        Self::ChecklistTemplates,
        Self::QualificationTypes,
        Self::AircraftTypes,
        Self::LicenseTypes,
        Self::SpecialQualifications,
        Self::Departments,
        Self::Staff,
        Self::DepartmentSettings,
        Self::Rosters,
        Self::RosterMetadata,
        Self::FlightLogs,
        Self::FlightHourAdjustments,
        Self::LeaveRequests,
        Self::LeaveTransactions,
        Self::NoticeDocuments,
        Self::NoticeAcknowledgments,
        Self::Questions,
        Self::Exams,
        Self::ExamAttempts,
        Self::SwapRequests,
        Self::Goals,
        Self::PerformanceTemplates,
        Self::PerformanceReviews,
        Self::CateringMenus,
        Self::CateringOrders,
    ];

    /// Reference collections reconciled by natural key, in the order they must run.
    /// Staff goes last: its rows point into every other collection here.
    pub const RECONCILE_ORDER: [Self; 8] = [
        Self::Roles,
        Self::Departments,
        Self::LeaveTypes,
        Self::AircraftTypes,
        Self::QualificationTypes,
        Self::LicenseTypes,
        Self::SpecialQualifications,
        Self::Staff,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Roles => "roles",
            Self::LeaveTypes => "leave_types",
            Self::Holidays => "holidays",
            Self::CustomFieldDefinitions => "custom_field_definitions",
            Self::ValidationRuleSets => "validation_rule_sets",
            Self::RosterViewTemplates => "roster_view_templates",
            Self::ChecklistTemplates => "checklist_templates",
            Self::QualificationTypes => "qualification_types",
            Self::AircraftTypes => "aircraft_types",
            Self::LicenseTypes => "license_types",
            Self::SpecialQualifications => "special_qualifications",
            Self::Departments => "departments",
            Self::Staff => "staff",
            Self::DepartmentSettings => "department_settings",
            Self::Rosters => "rosters",
            Self::RosterMetadata => "roster_metadata",
            Self::FlightLogs => "flight_logs",
            Self::FlightHourAdjustments => "flight_hour_adjustments",
            Self::LeaveRequests => "leave_requests",
            Self::LeaveTransactions => "leave_transactions",
            Self::NoticeDocuments => "notice_documents",
            Self::NoticeAcknowledgments => "notice_acknowledgments",
            Self::Questions => "questions",
            Self::Exams => "exams",
            Self::ExamAttempts => "exam_attempts",
            Self::SwapRequests => "swap_requests",
            Self::Goals => "goals",
            Self::PerformanceTemplates => "performance_templates",
            Self::PerformanceReviews => "performance_reviews",
            Self::CateringMenus => "catering_menus",
            Self::CateringOrders => "catering_orders",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.as_str() == value)
    }

    #[must_use]
    pub fn descriptor(self) -> &'static TableDescriptor {
        match self {
            Self::Roles => &ROLES,
            Self::LeaveTypes => &LEAVE_TYPES,
            Self::Holidays => &HOLIDAYS,
            Self::CustomFieldDefinitions => &CUSTOM_FIELD_DEFINITIONS,
            Self::ValidationRuleSets => &VALIDATION_RULE_SETS,
            Self::RosterViewTemplates => &ROSTER_VIEW_TEMPLATES,
            Self::ChecklistTemplates => &CHECKLIST_TEMPLATES,
            Self::QualificationTypes => &QUALIFICATION_TYPES,
            Self::AircraftTypes => &AIRCRAFT_TYPES,
            Self::LicenseTypes => &LICENSE_TYPES,
            Self::SpecialQualifications => &SPECIAL_QUALIFICATIONS,
            Self::Departments => &DEPARTMENTS,
            Self::Staff => &STAFF,
            Self::DepartmentSettings => &DEPARTMENT_SETTINGS,
            Self::Rosters => &ROSTERS,
            Self::RosterMetadata => &ROSTER_METADATA,
            Self::FlightLogs => &FLIGHT_LOGS,
            Self::FlightHourAdjustments => &FLIGHT_HOUR_ADJUSTMENTS,
            Self::LeaveRequests => &LEAVE_REQUESTS,
            Self::LeaveTransactions => &LEAVE_TRANSACTIONS,
            Self::NoticeDocuments => &NOTICE_DOCUMENTS,
            Self::NoticeAcknowledgments => &NOTICE_ACKNOWLEDGMENTS,
            Self::Questions => &QUESTIONS,
            Self::Exams => &EXAMS,
            Self::ExamAttempts => &EXAM_ATTEMPTS,
            Self::SwapRequests => &SWAP_REQUESTS,
            Self::Goals => &GOALS,
            Self::PerformanceTemplates => &PERFORMANCE_TEMPLATES,
            Self::PerformanceReviews => &PERFORMANCE_REVIEWS,
            Self::CateringMenus => &CATERING_MENUS,
            Self::CateringOrders => &CATERING_ORDERS,
        }
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TableRole {
    /// Shared lookup and configuration entities.
    Reference,
    StaffLike,
    Structural,
    Historical,
}

impl TableRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::StaffLike => "staff_like",
            Self::Structural => "structural",
            Self::Historical => "historical",
        }
    }

    /// Whether a permission-denied write may be skipped instead of aborting the restore.
    #[must_use]
    pub fn tolerates_denied_writes(self) -> bool {
        matches!(self, Self::Reference)
    }
}

/// A field whose value (scalar, list, nested object, or map keys) carries
/// identifiers of `target` rows.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FieldRef {
    pub field: &'static str,
    pub target: TableName,
}

/// Shapes older snapshots used instead of a flat row list.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LegacyShape {
    /// `departmentId -> row fields`.
    ByDepartment,
    /// `monthKey -> departmentId -> payload`. With `payload_field` set the payload is
    /// stored under that field; otherwise its fields are merged into the row.
    ByMonthAndDepartment { payload_field: Option<&'static str> },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TableDescriptor {
    pub name: TableName,
    pub role: TableRole,
    pub natural_key: Option<&'static str>,
    pub requires_strict_id: bool,
    pub conflict_key: &'static [&'static str],
    pub retired_fields: &'static [&'static str],
    /// `(deprecated, replacement)` pairs.
    pub renamed_fields: &'static [(&'static str, &'static str)],
    pub required_date_field: Option<&'static str>,
    pub references: &'static [FieldRef],
    pub legacy_shape: Option<LegacyShape>,
}

impl TableDescriptor {
    const fn new(name: TableName, role: TableRole) -> Self {
        Self {
            name,
            role,
            natural_key: None,
            requires_strict_id: false,
            conflict_key: &["id"],
            retired_fields: &[],
            renamed_fields: &[],
            required_date_field: None,
            references: &[],
            legacy_shape: None,
        }
    }

    /// Fields of this table that reference rows of `target`.
    pub fn references_to(&self, target: TableName) -> impl Iterator<Item = &'static str> {
        let references: &'static [FieldRef] = self.references;
        references.iter().filter(move |reference| reference.target == target).map(|r| r.field)
    }
}

/// Fields the target store maintains itself; never written from a snapshot.
pub const SERVER_MANAGED_FIELDS: &[&str] = &["created_at", "updated_at"];

/// Self-referential department field linking a department to its manager (a staff row).
pub const DEPARTMENT_MANAGER_FIELD: &str = "manager_id";

/// Staff field binding a staff row to an authentication identity.
pub const AUTH_LINK_FIELD: &str = "auth_user_id";

const fn field_ref(field: &'static str, target: TableName) -> FieldRef {
    FieldRef { field, target }
}

use TableName as T;
use TableRole as R;

static ROLES: TableDescriptor = TableDescriptor {
    natural_key: Some("name"),
    retired_fields: &["is_system"],
    ..TableDescriptor::new(T::Roles, R::Reference)
};

static LEAVE_TYPES: TableDescriptor =
    TableDescriptor { natural_key: Some("name"), ..TableDescriptor::new(T::LeaveTypes, R::Reference) };

static HOLIDAYS: TableDescriptor = TableDescriptor {
    required_date_field: Some("date"),
    references: &[field_ref("department_ids", T::Departments)],
    ..TableDescriptor::new(T::Holidays, R::Reference)
};

static CUSTOM_FIELD_DEFINITIONS: TableDescriptor = TableDescriptor {
    references: &[field_ref("department_id", T::Departments)],
    ..TableDescriptor::new(T::CustomFieldDefinitions, R::Reference)
};

static VALIDATION_RULE_SETS: TableDescriptor = TableDescriptor {
    references: &[
        field_ref("department_id", T::Departments),
        field_ref("rules", T::QualificationTypes),
        field_ref("rules", T::AircraftTypes),
        field_ref("rules", T::LicenseTypes),
        field_ref("rules", T::SpecialQualifications),
    ],
    ..TableDescriptor::new(T::ValidationRuleSets, R::Reference)
};

static ROSTER_VIEW_TEMPLATES: TableDescriptor = TableDescriptor {
    references: &[
        field_ref("department_id", T::Departments),
        field_ref("staff_order", T::Staff),
        field_ref("created_by", T::Staff),
    ],
    ..TableDescriptor::new(T::RosterViewTemplates, R::Reference)
};

static CHECKLIST_TEMPLATES: TableDescriptor = TableDescriptor {
    references: &[field_ref("role_ids", T::Roles), field_ref("department_id", T::Departments)],
    ..TableDescriptor::new(T::ChecklistTemplates, R::Reference)
};

static QUALIFICATION_TYPES: TableDescriptor = TableDescriptor {
    natural_key: Some("code"),
    references: &[field_ref("aircraft_type_id", T::AircraftTypes)],
    ..TableDescriptor::new(T::QualificationTypes, R::Reference)
};

static AIRCRAFT_TYPES: TableDescriptor = TableDescriptor {
    natural_key: Some("name"),
    ..TableDescriptor::new(T::AircraftTypes, R::Reference)
};

static LICENSE_TYPES: TableDescriptor = TableDescriptor {
    natural_key: Some("name"),
    ..TableDescriptor::new(T::LicenseTypes, R::Reference)
};

static SPECIAL_QUALIFICATIONS: TableDescriptor = TableDescriptor {
    natural_key: Some("name"),
    ..TableDescriptor::new(T::SpecialQualifications, R::Reference)
};

static DEPARTMENTS: TableDescriptor = TableDescriptor {
    natural_key: Some("name"),
    retired_fields: &["member_count"],
    renamed_fields: &[("manager", DEPARTMENT_MANAGER_FIELD)],
    references: &[
        field_ref("parent_id", T::Departments),
        field_ref(DEPARTMENT_MANAGER_FIELD, T::Staff),
        field_ref("manager", T::Staff),
    ],
    ..TableDescriptor::new(T::Departments, R::Structural)
};

static STAFF: TableDescriptor = TableDescriptor {
    natural_key: Some("email"),
    retired_fields: &["password", "avatar_data"],
    renamed_fields: &[("dept_id", "department_id")],
    references: &[
        field_ref("role_id", T::Roles),
        field_ref("department_id", T::Departments),
        field_ref("dept_id", T::Departments),
        field_ref("qualification_ids", T::QualificationTypes),
        field_ref("aircraft_type_ids", T::AircraftTypes),
        field_ref("licenses", T::LicenseTypes),
        field_ref("special_qualification_ids", T::SpecialQualifications),
        field_ref("leave_balances", T::LeaveTypes),
        field_ref("supervisor_id", T::Staff),
    ],
    ..TableDescriptor::new(T::Staff, R::StaffLike)
};

static DEPARTMENT_SETTINGS: TableDescriptor = TableDescriptor {
    conflict_key: &["department_id"],
    references: &[
        field_ref("department_id", T::Departments),
        field_ref("default_leave_type_id", T::LeaveTypes),
        field_ref("approver_ids", T::Staff),
    ],
    legacy_shape: Some(LegacyShape::ByDepartment),
    ..TableDescriptor::new(T::DepartmentSettings, R::Structural)
};

static ROSTERS: TableDescriptor = TableDescriptor {
    conflict_key: &["month", "department_id"],
    references: &[field_ref("department_id", T::Departments), field_ref("grid", T::Staff)],
    legacy_shape: Some(LegacyShape::ByMonthAndDepartment { payload_field: Some("grid") }),
    ..TableDescriptor::new(T::Rosters, R::Structural)
};

static ROSTER_METADATA: TableDescriptor = TableDescriptor {
    conflict_key: &["month", "department_id"],
    references: &[
        field_ref("department_id", T::Departments),
        field_ref("published_by", T::Staff),
    ],
    legacy_shape: Some(LegacyShape::ByMonthAndDepartment { payload_field: None }),
    ..TableDescriptor::new(T::RosterMetadata, R::Structural)
};

static FLIGHT_LOGS: TableDescriptor = TableDescriptor {
    requires_strict_id: true,
    required_date_field: Some("date"),
    renamed_fields: &[("aircraft", "aircraft_type_id")],
    references: &[
        field_ref("staff_id", T::Staff),
        field_ref("aircraft_type_id", T::AircraftTypes),
        field_ref("aircraft", T::AircraftTypes),
    ],
    ..TableDescriptor::new(T::FlightLogs, R::Historical)
};

static FLIGHT_HOUR_ADJUSTMENTS: TableDescriptor = TableDescriptor {
    requires_strict_id: true,
    references: &[field_ref("staff_id", T::Staff), field_ref("adjusted_by", T::Staff)],
    ..TableDescriptor::new(T::FlightHourAdjustments, R::Historical)
};

static LEAVE_REQUESTS: TableDescriptor = TableDescriptor {
    renamed_fields: &[("leave_type", "leave_type_id")],
    references: &[
        field_ref("staff_id", T::Staff),
        field_ref("leave_type_id", T::LeaveTypes),
        field_ref("leave_type", T::LeaveTypes),
        field_ref("approved_by", T::Staff),
    ],
    ..TableDescriptor::new(T::LeaveRequests, R::Historical)
};

static LEAVE_TRANSACTIONS: TableDescriptor = TableDescriptor {
    requires_strict_id: true,
    references: &[field_ref("staff_id", T::Staff), field_ref("leave_type_id", T::LeaveTypes)],
    ..TableDescriptor::new(T::LeaveTransactions, R::Historical)
};

static NOTICE_DOCUMENTS: TableDescriptor = TableDescriptor {
    references: &[
        field_ref("author_id", T::Staff),
        field_ref("department_ids", T::Departments),
        field_ref("role_ids", T::Roles),
    ],
    ..TableDescriptor::new(T::NoticeDocuments, R::Historical)
};

static NOTICE_ACKNOWLEDGMENTS: TableDescriptor = TableDescriptor {
    requires_strict_id: true,
    references: &[field_ref("staff_id", T::Staff)],
    ..TableDescriptor::new(T::NoticeAcknowledgments, R::Historical)
};

static QUESTIONS: TableDescriptor = TableDescriptor {
    references: &[
        field_ref("qualification_type_id", T::QualificationTypes),
        field_ref("aircraft_type_id", T::AircraftTypes),
    ],
    ..TableDescriptor::new(T::Questions, R::Historical)
};

static EXAMS: TableDescriptor = TableDescriptor {
    retired_fields: &["questions_cache"],
    references: &[
        field_ref("qualification_type_id", T::QualificationTypes),
        field_ref("assigned_staff_ids", T::Staff),
        field_ref("department_id", T::Departments),
    ],
    ..TableDescriptor::new(T::Exams, R::Historical)
};

static EXAM_ATTEMPTS: TableDescriptor = TableDescriptor {
    requires_strict_id: true,
    references: &[field_ref("staff_id", T::Staff)],
    ..TableDescriptor::new(T::ExamAttempts, R::Historical)
};

static SWAP_REQUESTS: TableDescriptor = TableDescriptor {
    requires_strict_id: true,
    references: &[
        field_ref("requester_id", T::Staff),
        field_ref("target_id", T::Staff),
        field_ref("approved_by", T::Staff),
        field_ref("department_id", T::Departments),
    ],
    ..TableDescriptor::new(T::SwapRequests, R::Historical)
};

static GOALS: TableDescriptor = TableDescriptor {
    references: &[field_ref("staff_id", T::Staff), field_ref("set_by", T::Staff)],
    ..TableDescriptor::new(T::Goals, R::Historical)
};

static PERFORMANCE_TEMPLATES: TableDescriptor = TableDescriptor {
    references: &[field_ref("role_ids", T::Roles), field_ref("department_id", T::Departments)],
    ..TableDescriptor::new(T::PerformanceTemplates, R::Historical)
};

static PERFORMANCE_REVIEWS: TableDescriptor = TableDescriptor {
    requires_strict_id: true,
    references: &[field_ref("staff_id", T::Staff), field_ref("reviewer_id", T::Staff)],
    ..TableDescriptor::new(T::PerformanceReviews, R::Historical)
};

static CATERING_MENUS: TableDescriptor = TableDescriptor {
    required_date_field: Some("date"),
    references: &[field_ref("department_id", T::Departments)],
    ..TableDescriptor::new(T::CateringMenus, R::Historical)
};

static CATERING_ORDERS: TableDescriptor = TableDescriptor {
    requires_strict_id: true,
    references: &[field_ref("staff_id", T::Staff)],
    ..TableDescriptor::new(T::CateringOrders, R::Historical)
};
