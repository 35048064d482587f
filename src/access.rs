use std::time::Duration;

use ulid::Ulid;

use crate::engine::{EngineError, ErrorKind};
use crate::model::{Appointment, Owner, OwnerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Full access within their company.
    Owner,
    /// Access to their own appointments and work ranges only.
    Employee,
    /// Access to appointments where they are the client.
    Client,
}

/// Already-authenticated caller identity, resolved by the auth collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: Ulid,
    pub role: Role,
    pub company_id: Ulid,
}

impl Caller {
    pub fn owner(id: Ulid, company_id: Ulid) -> Self {
        Self { id, role: Role::Owner, company_id }
    }

    pub fn employee(id: Ulid, company_id: Ulid) -> Self {
        Self { id, role: Role::Employee, company_id }
    }

    pub fn client(id: Ulid, company_id: Ulid) -> Self {
        Self { id, role: Role::Client, company_id }
    }
}

/// Per-request context: who is calling, which company they claim to act in,
/// and how long storage may take before the request fails as transient.
#[derive(Debug, Clone, Copy)]
pub struct Ctx {
    pub caller: Caller,
    pub company_id: Ulid,
    pub timeout: Option<Duration>,
}

impl Ctx {
    pub fn new(caller: Caller, company_id: Ulid) -> Self {
        Self {
            caller,
            company_id,
            timeout: None,
        }
    }

    /// Context claiming the caller's own company.
    pub fn of(caller: Caller) -> Self {
        Self::new(caller, caller.company_id)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    Reschedule,
    Cancel,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Reschedule => "reschedule",
            Action::Cancel => "cancel",
        }
    }
}

/// Which appointments of the company a caller may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Company,
    Employee(Ulid),
    Client(Ulid),
}

impl Visibility {
    pub fn admits(&self, a: &Appointment) -> bool {
        match self {
            Visibility::Company => true,
            Visibility::Employee(id) => a.employee_id == *id,
            Visibility::Client(id) => a.client_id == *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessConfig {
    /// Report cross-tenant failures as not-found to the outside.
    pub conceal_cross_tenant: bool,
    /// Clients may book appointments for themselves.
    pub client_self_booking: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            conceal_cross_tenant: true,
            client_self_booking: true,
        }
    }
}

/// Tenancy guard plus the role rule table. Every scheduling operation passes
/// `guard` first, then `authorize`; `CrossTenant` and `Forbidden` stay distinct.
#[derive(Debug, Clone)]
pub struct Authorizer {
    config: AccessConfig,
}

impl Authorizer {
    pub fn new(config: AccessConfig) -> Self {
        Self { config }
    }

    /// Tenancy guard. `targets` are `(entity_id, owning_company_id)` pairs for
    /// every entity the operation touches.
    pub fn guard(&self, ctx: &Ctx, targets: &[(Ulid, Ulid)]) -> Result<(), EngineError> {
        if ctx.caller.company_id != ctx.company_id {
            return Err(EngineError::CrossTenant(ctx.company_id));
        }
        for &(entity_id, company_id) in targets {
            if company_id != ctx.company_id {
                return Err(EngineError::CrossTenant(entity_id));
            }
        }
        Ok(())
    }

    /// Role rule table for an appointment identified by its employee and client.
    pub fn authorize(
        &self,
        caller: &Caller,
        action: Action,
        employee_id: Ulid,
        client_id: Ulid,
    ) -> Result<(), EngineError> {
        match caller.role {
            Role::Owner => Ok(()),
            Role::Employee if caller.id == employee_id => Ok(()),
            Role::Employee => Err(EngineError::Forbidden(match action {
                Action::Create => "employees may only book for themselves",
                _ => "appointment belongs to another employee",
            })),
            Role::Client if action == Action::Create && !self.config.client_self_booking => {
                Err(EngineError::Forbidden("client booking is disabled"))
            }
            Role::Client if caller.id == client_id => Ok(()),
            Role::Client => Err(EngineError::Forbidden("appointment belongs to another client")),
        }
    }

    /// Clients may only hide their own booked time from availability.
    pub fn authorize_client_filter(&self, caller: &Caller, client_id: Ulid) -> Result<(), EngineError> {
        match caller.role {
            Role::Client if caller.id != client_id => {
                Err(EngineError::Forbidden("clients may only filter by their own appointments"))
            }
            _ => Ok(()),
        }
    }

    pub fn visibility(&self, caller: &Caller) -> Visibility {
        match caller.role {
            Role::Owner => Visibility::Company,
            Role::Employee => Visibility::Employee(caller.id),
            Role::Client => Visibility::Client(caller.id),
        }
    }

    /// Work-schedule edits: owners edit anything, employees their own ranges.
    pub fn authorize_schedule_edit(&self, caller: &Caller, owner: &Owner) -> Result<(), EngineError> {
        match caller.role {
            Role::Owner => Ok(()),
            Role::Employee if owner.kind == OwnerKind::Employee && owner.id == caller.id => Ok(()),
            Role::Employee => Err(EngineError::Forbidden("employees may only edit their own schedule")),
            Role::Client => Err(EngineError::Forbidden("clients cannot edit schedules")),
        }
    }

    /// Externally visible kind of a failure. With concealment on, a foreign
    /// tenant's record is indistinguishable from a missing one.
    pub fn surface(&self, err: &EngineError) -> ErrorKind {
        match err.kind() {
            ErrorKind::CrossTenant if self.config.conceal_cross_tenant => ErrorKind::NotFound,
            kind => kind,
        }
    }
}
