use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;
use ulid::Ulid;

use crate::access::{Ctx, Role};
use crate::limits::{MAX_NAME_LEN, MAX_SERVICE_DURATION_MS, MIN_SERVICE_DURATION_MS, MIN_SLOT_STEP_MS};
use crate::model::*;
use crate::zone;

use super::{Engine, EngineError};

/// A record stored in the engine's directory.
pub trait DirectoryEntity: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn id(&self) -> Ulid;
    fn company_id(&self) -> Ulid;
    fn saved(self) -> Event;
    fn removed(&self) -> Event;
    fn index(engine: &Engine) -> &DashMap<Ulid, Self>;

    /// Shape checks that need nothing but the record.
    fn validate(&self) -> Result<(), EngineError>;

    /// Referenced records must exist and share the company.
    fn check_references(&self, _engine: &Engine) -> Result<(), EngineError> {
        Ok(())
    }

    /// Still referenced by something that would dangle after deletion.
    fn in_use(engine: &Engine, id: Ulid) -> bool;
}

/// Storage of companies, branches, employees and services, with the tenancy
/// and role checks composed around it.
#[async_trait]
pub trait Repository<T: DirectoryEntity> {
    async fn create(&self, ctx: &Ctx, entity: T) -> Result<T, EngineError>;
    async fn get(&self, ctx: &Ctx, id: Ulid) -> Result<T, EngineError>;
    /// Replace a record. Its id and company never change.
    async fn update(&self, ctx: &Ctx, entity: T) -> Result<T, EngineError>;
    async fn delete(&self, ctx: &Ctx, id: Ulid) -> Result<(), EngineError>;
}

fn require_owner(ctx: &Ctx) -> Result<(), EngineError> {
    match ctx.caller.role {
        Role::Owner => Ok(()),
        _ => Err(EngineError::Forbidden("only owners manage the directory")),
    }
}

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

#[async_trait]
impl<T: DirectoryEntity> Repository<T> for Engine {
    async fn create(&self, ctx: &Ctx, entity: T) -> Result<T, EngineError> {
        self.authorizer.guard(ctx, &[(entity.id(), entity.company_id())])?;
        require_owner(ctx)?;
        entity.validate()?;

        let _gate = self.enter_gate(self.deadline(ctx)).await?;
        if T::index(self).contains_key(&entity.id()) {
            return Err(EngineError::AlreadyExists(entity.id()));
        }
        entity.check_references(self)?;
        self.persist_directory(entity.clone().saved()).await?;
        info!("{} {} created", T::KIND, entity.id());
        Ok(entity)
    }

    async fn get(&self, ctx: &Ctx, id: Ulid) -> Result<T, EngineError> {
        let entity = T::index(self)
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        self.authorizer.guard(ctx, &[(id, entity.company_id())])?;
        Ok(entity)
    }

    async fn update(&self, ctx: &Ctx, entity: T) -> Result<T, EngineError> {
        let id = entity.id();
        let stored_company = T::index(self)
            .get(&id)
            .map(|e| e.value().company_id())
            .ok_or(EngineError::NotFound(id))?;
        self.authorizer.guard(ctx, &[(id, stored_company)])?;
        require_owner(ctx)?;
        if entity.company_id() != stored_company {
            return Err(EngineError::InvalidInput("company_id cannot be changed".into()));
        }
        entity.validate()?;

        let _gate = self.enter_gate(self.deadline(ctx)).await?;
        entity.check_references(self)?;
        self.persist_directory(entity.clone().saved()).await?;
        Ok(entity)
    }

    async fn delete(&self, ctx: &Ctx, id: Ulid) -> Result<(), EngineError> {
        let entity = T::index(self)
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        self.authorizer.guard(ctx, &[(id, entity.company_id())])?;
        require_owner(ctx)?;

        let _gate = self.enter_gate(self.deadline(ctx)).await?;
        if T::in_use(self, id) {
            return Err(EngineError::InUse(id));
        }
        self.persist_directory(entity.removed()).await?;
        info!("{} {id} deleted", T::KIND);
        Ok(())
    }
}

// ── Record types ─────────────────────────────────────────────────

impl DirectoryEntity for Company {
    const KIND: &'static str = "company";

    fn id(&self) -> Ulid {
        self.id
    }

    fn company_id(&self) -> Ulid {
        self.id
    }

    fn saved(self) -> Event {
        Event::CompanySaved(self)
    }

    fn removed(&self) -> Event {
        Event::CompanyRemoved { id: self.id }
    }

    fn index(engine: &Engine) -> &DashMap<Ulid, Self> {
        &engine.companies
    }

    fn validate(&self) -> Result<(), EngineError> {
        check_name(&self.name)
    }

    fn in_use(engine: &Engine, id: Ulid) -> bool {
        engine.branches.iter().any(|b| b.company_id == id)
            || engine.employees.iter().any(|e| e.company_id == id)
            || engine.services.iter().any(|s| s.company_id == id)
    }
}

impl DirectoryEntity for Branch {
    const KIND: &'static str = "branch";

    fn id(&self) -> Ulid {
        self.id
    }

    fn company_id(&self) -> Ulid {
        self.company_id
    }

    fn saved(self) -> Event {
        Event::BranchSaved(self)
    }

    fn removed(&self) -> Event {
        Event::BranchRemoved {
            id: self.id,
            company_id: self.company_id,
        }
    }

    fn index(engine: &Engine) -> &DashMap<Ulid, Self> {
        &engine.branches
    }

    fn validate(&self) -> Result<(), EngineError> {
        check_name(&self.name)?;
        if zone::parse_zone(&self.time_zone).is_none() {
            return Err(EngineError::InvalidInput(format!("unknown time zone {:?}", self.time_zone)));
        }
        Ok(())
    }

    fn check_references(&self, engine: &Engine) -> Result<(), EngineError> {
        check_company(engine, self.company_id)?;
        check_services(engine, self.company_id, &self.services)
    }

    fn in_use(engine: &Engine, id: Ulid) -> bool {
        engine.employees.iter().any(|e| e.branches.contains(&id))
            || engine
                .appointments
                .iter()
                .any(|a| a.branch_id == id && a.is_scheduled())
            || engine.any_range(|r| r.branch_id == id)
    }
}

impl DirectoryEntity for Employee {
    const KIND: &'static str = "employee";

    fn id(&self) -> Ulid {
        self.id
    }

    fn company_id(&self) -> Ulid {
        self.company_id
    }

    fn saved(self) -> Event {
        Event::EmployeeSaved(self)
    }

    fn removed(&self) -> Event {
        Event::EmployeeRemoved {
            id: self.id,
            company_id: self.company_id,
        }
    }

    fn index(engine: &Engine) -> &DashMap<Ulid, Self> {
        &engine.employees
    }

    fn validate(&self) -> Result<(), EngineError> {
        check_name(&self.name)?;
        if let Some(step) = self.slot_step
            && !(MIN_SLOT_STEP_MS..=MAX_SERVICE_DURATION_MS).contains(&step)
        {
            return Err(EngineError::LimitExceeded("slot step out of range"));
        }
        Ok(())
    }

    fn check_references(&self, engine: &Engine) -> Result<(), EngineError> {
        check_company(engine, self.company_id)?;
        check_services(engine, self.company_id, &self.services)?;
        for branch_id in &self.branches {
            let company = engine
                .branches
                .get(branch_id)
                .map(|b| b.company_id)
                .ok_or(EngineError::NotFound(*branch_id))?;
            if company != self.company_id {
                return Err(EngineError::CrossTenant(*branch_id));
            }
        }
        Ok(())
    }

    fn in_use(engine: &Engine, id: Ulid) -> bool {
        engine
            .appointments
            .iter()
            .any(|a| a.employee_id == id && a.is_scheduled())
            || engine.any_range(|r| r.owner == Owner::employee(id))
    }
}

impl DirectoryEntity for Service {
    const KIND: &'static str = "service";

    fn id(&self) -> Ulid {
        self.id
    }

    fn company_id(&self) -> Ulid {
        self.company_id
    }

    fn saved(self) -> Event {
        Event::ServiceSaved(self)
    }

    fn removed(&self) -> Event {
        Event::ServiceRemoved {
            id: self.id,
            company_id: self.company_id,
        }
    }

    fn index(engine: &Engine) -> &DashMap<Ulid, Self> {
        &engine.services
    }

    fn validate(&self) -> Result<(), EngineError> {
        check_name(&self.name)?;
        if !(MIN_SERVICE_DURATION_MS..=MAX_SERVICE_DURATION_MS).contains(&self.duration) {
            return Err(EngineError::LimitExceeded("service duration out of range"));
        }
        Ok(())
    }

    fn check_references(&self, engine: &Engine) -> Result<(), EngineError> {
        check_company(engine, self.company_id)
    }

    fn in_use(engine: &Engine, id: Ulid) -> bool {
        engine.branches.iter().any(|b| b.services.contains(&id))
            || engine.employees.iter().any(|e| e.services.contains(&id))
            || engine
                .appointments
                .iter()
                .any(|a| a.service_id == id && a.is_scheduled())
            || engine.any_range(|r| r.offers(&id))
    }
}

fn check_company(engine: &Engine, company_id: Ulid) -> Result<(), EngineError> {
    if engine.companies.contains_key(&company_id) {
        Ok(())
    } else {
        Err(EngineError::NotFound(company_id))
    }
}

fn check_services(engine: &Engine, company_id: Ulid, services: &BTreeSet<Ulid>) -> Result<(), EngineError> {
    for service_id in services {
        let company = engine
            .services
            .get(service_id)
            .map(|s| s.company_id)
            .ok_or(EngineError::NotFound(*service_id))?;
        if company != company_id {
            return Err(EngineError::CrossTenant(*service_id));
        }
    }
    Ok(())
}

impl Engine {
    /// True if any stored work range matches. A schedule that is being
    /// edited right now counts as a match.
    fn any_range(&self, pred: impl Fn(&WorkRange) -> bool) -> bool {
        self.schedules.iter().any(|entry| match entry.value().try_read() {
            Ok(schedule) => schedule.ranges.iter().any(&pred),
            Err(_) => true,
        })
    }
}
