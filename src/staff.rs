//! Read-only view of employees, used to validate assignments.
//!
//! Staff records belong to the HR side of the platform; the engine only looks
//! them up and never writes them.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{CaseError, Result};
use crate::types::{CaseType, StaffId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    Admin,
    Manager,
    PropertyManager,
    MaintenanceSupervisor,
    SupportAgent,
    SalesExecutive,
    Accountant,
    HousekeepingSupervisor,
    MaintenanceTechnician,
    HousekeepingStaff,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentStatus {
    #[default]
    Active,
    Inactive,
    Terminated,
    OnLeave,
}

/// Permission flags relevant to case handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub can_manage_leads: bool,
    pub can_handle_support_tickets: bool,
    pub can_manage_residents: bool,
    pub can_handle_maintenance: bool,
    pub can_manage_housekeeping: bool,
}

impl Permissions {
    pub fn all() -> Self {
        Self {
            can_manage_leads: true,
            can_handle_support_tickets: true,
            can_manage_residents: true,
            can_handle_maintenance: true,
            can_manage_housekeeping: true,
        }
    }

    /// Default flags for a role.
    pub fn for_role(role: StaffRole) -> Self {
        let none = Self::default();
        match role {
            StaffRole::Admin | StaffRole::Manager => Self::all(),
            StaffRole::PropertyManager => Self {
                can_manage_residents: true,
                can_handle_support_tickets: true,
                can_handle_maintenance: true,
                ..none
            },
            StaffRole::SupportAgent => Self {
                can_handle_support_tickets: true,
                ..none
            },
            StaffRole::SalesExecutive => Self {
                can_manage_leads: true,
                ..none
            },
            StaffRole::MaintenanceSupervisor | StaffRole::MaintenanceTechnician => Self {
                can_handle_maintenance: true,
                ..none
            },
            StaffRole::HousekeepingSupervisor | StaffRole::HousekeepingStaff => Self {
                can_manage_housekeeping: true,
                ..none
            },
            StaffRole::Accountant => none,
        }
    }

    pub fn allows(&self, case_type: CaseType) -> bool {
        match case_type {
            CaseType::Lead => self.can_manage_leads,
            CaseType::Ticket => self.can_handle_support_tickets,
            CaseType::Contract => self.can_manage_residents,
            CaseType::Maintenance => self.can_handle_maintenance,
            CaseType::Housekeeping => self.can_manage_housekeeping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: StaffId,
    pub name: String,
    pub role: StaffRole,
    pub permissions: Permissions,
    #[serde(default)]
    pub status: EmploymentStatus,
}

impl StaffMember {
    pub fn new(name: impl Into<String>, role: StaffRole) -> Self {
        Self {
            id: StaffId::new(),
            name: name.into(),
            role,
            permissions: Permissions::for_role(role),
            status: EmploymentStatus::Active,
        }
    }

    pub fn with_status(mut self, status: EmploymentStatus) -> Self {
        self.status = status;
        self
    }
}

/// Lookup of staff by id.
pub trait StaffDirectory: Send + Sync {
    fn get(&self, id: StaffId) -> Option<StaffMember>;
}

/// In-process directory, filled by whoever owns the employee data.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    members: RwLock<HashMap<StaffId, StaffMember>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, member: StaffMember) {
        let mut members = self.members.write().unwrap_or_else(|p| p.into_inner());
        members.insert(member.id, member);
    }
}

impl StaffDirectory for InMemoryDirectory {
    fn get(&self, id: StaffId) -> Option<StaffMember> {
        let members = self.members.read().unwrap_or_else(|p| p.into_inner());
        members.get(&id).cloned()
    }
}

fn active_member(directory: &dyn StaffDirectory, id: StaffId) -> Result<StaffMember> {
    let member = directory
        .get(id)
        .ok_or_else(|| CaseError::validation("assigned_to", format!("unknown staff {id}")))?;
    if member.status != EmploymentStatus::Active {
        return Err(CaseError::validation(
            "assigned_to",
            format!("{} is not active", member.name),
        ));
    }
    Ok(member)
}

/// Case types an active staff member may own.
pub fn assignable_types(directory: &dyn StaffDirectory, id: StaffId) -> Result<Vec<CaseType>> {
    let member = active_member(directory, id)?;
    Ok(CaseType::ALL
        .into_iter()
        .filter(|t| member.permissions.allows(*t))
        .collect())
}

/// Check that `id` may own a case of `case_type`.
pub fn check_assignable(
    directory: &dyn StaffDirectory,
    id: StaffId,
    case_type: CaseType,
) -> Result<StaffMember> {
    let member = active_member(directory, id)?;
    if !member.permissions.allows(case_type) {
        return Err(CaseError::validation(
            "assigned_to",
            format!("{} may not handle {case_type} cases", member.name),
        ));
    }
    Ok(member)
}
