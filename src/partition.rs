//! Tenant partition store.
//!
//! Tenant-scoped rows are only reachable through a [`TenantPartition`], which
//! [`PartitionStore::scope`] hands out for registered companies. Every
//! statement the handle runs filters (or writes) its tenant id, and every row
//! read back is checked against it before it is returned.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use validator::Validate;

use crate::{
    errors::AppError,
    registry,
    structs::{
        BiddingDocument, Client, Company, NewBiddingDocument, NewClient, NewProject, Project,
        Setting,
    },
};

const PROJECT_INSERT: &str = "INSERT INTO projects (tenant_id, title, reference_number, agency, category, procurement_mode, budget, closing_date, notes, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *";
const PROJECT_GET: &str = "SELECT * FROM projects WHERE tenant_id = ? AND id = ?";
const PROJECT_LIST: &str =
    "SELECT * FROM projects WHERE tenant_id = ? ORDER BY created_at DESC, id DESC";
const PROJECT_UPDATE: &str = "UPDATE projects SET title = ?, reference_number = ?, agency = ?, category = ?, procurement_mode = ?, budget = ?, closing_date = ?, notes = ?, updated_at = ? WHERE tenant_id = ? AND id = ? RETURNING *";
const PROJECT_DELETE: &str = "DELETE FROM projects WHERE tenant_id = ? AND id = ?";

const DOCUMENT_INSERT: &str = "INSERT INTO bidding_documents (tenant_id, project_id, title, doc_type, content, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *";
const DOCUMENT_GET: &str = "SELECT * FROM bidding_documents WHERE tenant_id = ? AND id = ?";
const DOCUMENT_LIST: &str =
    "SELECT * FROM bidding_documents WHERE tenant_id = ? ORDER BY created_at DESC, id DESC";
const DOCUMENT_LIST_FOR_PROJECT: &str = "SELECT * FROM bidding_documents WHERE tenant_id = ? AND project_id = ? ORDER BY created_at DESC, id DESC";
const DOCUMENT_UPDATE: &str = "UPDATE bidding_documents SET project_id = ?, title = ?, doc_type = ?, content = ?, updated_at = ? WHERE tenant_id = ? AND id = ? RETURNING *";
const DOCUMENT_DELETE: &str = "DELETE FROM bidding_documents WHERE tenant_id = ? AND id = ?";

const CLIENT_INSERT: &str = "INSERT INTO clients (tenant_id, name, contact_person, email, phone, address, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *";
const CLIENT_GET: &str = "SELECT * FROM clients WHERE tenant_id = ? AND id = ?";
const CLIENT_LIST: &str = "SELECT * FROM clients WHERE tenant_id = ? ORDER BY name ASC, id ASC";
const CLIENT_UPDATE: &str = "UPDATE clients SET name = ?, contact_person = ?, email = ?, phone = ?, address = ?, updated_at = ? WHERE tenant_id = ? AND id = ? RETURNING *";
const CLIENT_DELETE: &str = "DELETE FROM clients WHERE tenant_id = ? AND id = ?";

const SETTING_PUT: &str = "INSERT INTO settings (tenant_id, setting_key, value, updated_at) VALUES (?, ?, ?, ?) ON CONFLICT (tenant_id, setting_key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at RETURNING *";
const SETTING_GET: &str = "SELECT * FROM settings WHERE tenant_id = ? AND setting_key = ?";
const SETTING_LIST: &str = "SELECT * FROM settings WHERE tenant_id = ? ORDER BY setting_key ASC";
const SETTING_DELETE: &str = "DELETE FROM settings WHERE tenant_id = ? AND setting_key = ?";

const SETTING_KEY_MAX: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(i64);

impl TenantId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<&Company> for TenantId {
    fn from(company: &Company) -> Self {
        Self(company.id)
    }
}

/// A row that belongs to exactly one tenant.
pub trait TenantScoped {
    fn tenant_id(&self) -> i64;
}

impl TenantScoped for Project {
    fn tenant_id(&self) -> i64 {
        self.tenant_id
    }
}

impl TenantScoped for BiddingDocument {
    fn tenant_id(&self) -> i64 {
        self.tenant_id
    }
}

impl TenantScoped for Client {
    fn tenant_id(&self) -> i64 {
        self.tenant_id
    }
}

impl TenantScoped for Setting {
    fn tenant_id(&self) -> i64 {
        self.tenant_id
    }
}

fn forbidden(message: String) -> AppError {
    log::warn!("Tenant scope violation: {}", message);
    AppError::Forbidden(message)
}

#[derive(Debug, Clone)]
pub struct PartitionStore {
    pool: SqlitePool,
}

impl PartitionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the partition of a registered company.
    pub async fn scope(&self, tenant: TenantId) -> Result<TenantPartition, AppError> {
        if tenant.get() <= 0 {
            return Err(forbidden(format!("invalid tenant id {}", tenant.get())));
        }
        let company = registry::get_company_by_id(&self.pool, tenant.get())
            .await?
            .ok_or_else(|| forbidden(format!("unknown tenant {}", tenant.get())))?;

        Ok(TenantPartition {
            pool: self.pool.clone(),
            tenant,
            locator: company.partition_locator,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TenantPartition {
    pool: SqlitePool,
    tenant: TenantId,
    locator: String,
}

impl TenantPartition {
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Refuses any statement that does not carry this tenant's id: inserts
    /// must write `tenant_id` first, everything else must filter on it first.
    /// The tenant id is therefore always the first bound parameter.
    fn guard(&self, sql: &'static str) -> Result<&'static str, AppError> {
        let scoped = if sql.starts_with("INSERT") {
            sql.contains("(tenant_id,")
        } else {
            sql.contains("WHERE tenant_id = ?")
        };
        if scoped {
            Ok(sql)
        } else {
            Err(forbidden(format!(
                "unscoped statement rejected for tenant {}: {}",
                self.tenant.get(),
                sql
            )))
        }
    }

    fn confine_one<T: TenantScoped>(&self, row: T) -> Result<T, AppError> {
        if row.tenant_id() == self.tenant.get() {
            Ok(row)
        } else {
            Err(forbidden(format!(
                "row of tenant {} surfaced in partition {}",
                row.tenant_id(),
                self.tenant.get()
            )))
        }
    }

    fn confine<T: TenantScoped>(&self, rows: Vec<T>) -> Result<Vec<T>, AppError> {
        rows.into_iter().map(|row| self.confine_one(row)).collect()
    }

    fn confine_opt<T: TenantScoped>(&self, row: Option<T>, what: &str) -> Result<T, AppError> {
        match row {
            Some(row) => self.confine_one(row),
            None => Err(AppError::NotFound(format!("{what} not found"))),
        }
    }

    // Projects

    pub async fn insert_project(&self, new: &NewProject) -> Result<Project, AppError> {
        new.validate()?;
        let created_at = Utc::now();
        let project = sqlx::query_as::<_, Project>(self.guard(PROJECT_INSERT)?)
            .bind(self.tenant.get())
            .bind(new.title.trim())
            .bind(&new.reference_number)
            .bind(&new.agency)
            .bind(&new.category)
            .bind(&new.procurement_mode)
            .bind(&new.budget)
            .bind(new.closing_date)
            .bind(&new.notes)
            .bind(created_at)
            .bind(created_at)
            .fetch_one(&self.pool)
            .await?;
        log::info!("Project {} created in {}", project.id, self.locator);
        self.confine_one(project)
    }

    async fn find_project(&self, id: i64) -> Result<Option<Project>, AppError> {
        let project = sqlx::query_as::<_, Project>(self.guard(PROJECT_GET)?)
            .bind(self.tenant.get())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        project.map(|p| self.confine_one(p)).transpose()
    }

    pub async fn get_project(&self, id: i64) -> Result<Project, AppError> {
        let project = self.find_project(id).await?;
        self.confine_opt(project, "Project")
    }

    /// Newest first.
    pub async fn list_projects(&self) -> Result<Vec<Project>, AppError> {
        let projects = sqlx::query_as::<_, Project>(self.guard(PROJECT_LIST)?)
            .bind(self.tenant.get())
            .fetch_all(&self.pool)
            .await?;
        self.confine(projects)
    }

    pub async fn update_project(&self, id: i64, update: &NewProject) -> Result<Project, AppError> {
        update.validate()?;
        let project = sqlx::query_as::<_, Project>(self.guard(PROJECT_UPDATE)?)
            .bind(update.title.trim())
            .bind(&update.reference_number)
            .bind(&update.agency)
            .bind(&update.category)
            .bind(&update.procurement_mode)
            .bind(&update.budget)
            .bind(update.closing_date)
            .bind(&update.notes)
            .bind(Utc::now())
            .bind(self.tenant.get())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        self.confine_opt(project, "Project")
    }

    /// Also removes the project's bidding documents.
    pub async fn delete_project(&self, id: i64) -> Result<(), AppError> {
        let result = sqlx::query(self.guard(PROJECT_DELETE)?)
            .bind(self.tenant.get())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Project not found".to_owned()));
        }
        log::info!("Project {} deleted from {}", id, self.locator);
        Ok(())
    }

    // Bidding documents

    async fn ensure_project_in_partition(&self, project_id: i64) -> Result<(), AppError> {
        if self.find_project(project_id).await?.is_none() {
            return Err(AppError::Validation(
                "Referenced project does not belong to this company".to_owned(),
            ));
        }
        Ok(())
    }

    pub async fn insert_document(
        &self,
        new: &NewBiddingDocument,
    ) -> Result<BiddingDocument, AppError> {
        new.validate()?;
        self.ensure_project_in_partition(new.project_id).await?;

        let now = Utc::now();
        let document = sqlx::query_as::<_, BiddingDocument>(self.guard(DOCUMENT_INSERT)?)
            .bind(self.tenant.get())
            .bind(new.project_id)
            .bind(new.title.trim())
            .bind(&new.doc_type)
            .bind(&new.content)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        log::info!(
            "Document {} created for project {} in {}",
            document.id,
            document.project_id,
            self.locator
        );
        self.confine_one(document)
    }

    pub async fn get_document(&self, id: i64) -> Result<BiddingDocument, AppError> {
        let document = sqlx::query_as::<_, BiddingDocument>(self.guard(DOCUMENT_GET)?)
            .bind(self.tenant.get())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        self.confine_opt(document, "Document")
    }

    pub async fn list_documents(&self) -> Result<Vec<BiddingDocument>, AppError> {
        let documents = sqlx::query_as::<_, BiddingDocument>(self.guard(DOCUMENT_LIST)?)
            .bind(self.tenant.get())
            .fetch_all(&self.pool)
            .await?;
        self.confine(documents)
    }

    pub async fn list_project_documents(
        &self,
        project_id: i64,
    ) -> Result<Vec<BiddingDocument>, AppError> {
        let documents =
            sqlx::query_as::<_, BiddingDocument>(self.guard(DOCUMENT_LIST_FOR_PROJECT)?)
                .bind(self.tenant.get())
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        self.confine(documents)
    }

    pub async fn update_document(
        &self,
        id: i64,
        update: &NewBiddingDocument,
    ) -> Result<BiddingDocument, AppError> {
        update.validate()?;
        self.ensure_project_in_partition(update.project_id).await?;

        let document = sqlx::query_as::<_, BiddingDocument>(self.guard(DOCUMENT_UPDATE)?)
            .bind(update.project_id)
            .bind(update.title.trim())
            .bind(&update.doc_type)
            .bind(&update.content)
            .bind(Utc::now())
            .bind(self.tenant.get())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        self.confine_opt(document, "Document")
    }

    pub async fn delete_document(&self, id: i64) -> Result<(), AppError> {
        let result = sqlx::query(self.guard(DOCUMENT_DELETE)?)
            .bind(self.tenant.get())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Document not found".to_owned()));
        }
        Ok(())
    }

    // Clients

    pub async fn insert_client(&self, new: &NewClient) -> Result<Client, AppError> {
        new.validate()?;
        let now = Utc::now();
        let client = sqlx::query_as::<_, Client>(self.guard(CLIENT_INSERT)?)
            .bind(self.tenant.get())
            .bind(new.name.trim())
            .bind(&new.contact_person)
            .bind(&new.email)
            .bind(&new.phone)
            .bind(&new.address)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        log::info!("Client {} created in {}", client.id, self.locator);
        self.confine_one(client)
    }

    pub async fn get_client(&self, id: i64) -> Result<Client, AppError> {
        let client = sqlx::query_as::<_, Client>(self.guard(CLIENT_GET)?)
            .bind(self.tenant.get())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        self.confine_opt(client, "Client")
    }

    pub async fn list_clients(&self) -> Result<Vec<Client>, AppError> {
        let clients = sqlx::query_as::<_, Client>(self.guard(CLIENT_LIST)?)
            .bind(self.tenant.get())
            .fetch_all(&self.pool)
            .await?;
        self.confine(clients)
    }

    pub async fn update_client(&self, id: i64, update: &NewClient) -> Result<Client, AppError> {
        update.validate()?;
        let client = sqlx::query_as::<_, Client>(self.guard(CLIENT_UPDATE)?)
            .bind(update.name.trim())
            .bind(&update.contact_person)
            .bind(&update.email)
            .bind(&update.phone)
            .bind(&update.address)
            .bind(Utc::now())
            .bind(self.tenant.get())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        self.confine_opt(client, "Client")
    }

    pub async fn delete_client(&self, id: i64) -> Result<(), AppError> {
        let result = sqlx::query(self.guard(CLIENT_DELETE)?)
            .bind(self.tenant.get())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Client not found".to_owned()));
        }
        Ok(())
    }

    // Settings

    /// Sets `key` to `value`, replacing any previous value for this tenant.
    pub async fn put_setting(&self, key: &str, value: &str) -> Result<Setting, AppError> {
        let key = key.trim();
        if key.is_empty() || key.chars().count() > SETTING_KEY_MAX {
            return Err(AppError::Validation(format!(
                "Setting key must be between 1 and {SETTING_KEY_MAX} characters"
            )));
        }
        let setting = sqlx::query_as::<_, Setting>(self.guard(SETTING_PUT)?)
            .bind(self.tenant.get())
            .bind(key)
            .bind(value)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        self.confine_one(setting)
    }

    pub async fn get_setting(&self, key: &str) -> Result<Setting, AppError> {
        let setting = sqlx::query_as::<_, Setting>(self.guard(SETTING_GET)?)
            .bind(self.tenant.get())
            .bind(key.trim())
            .fetch_optional(&self.pool)
            .await?;
        self.confine_opt(setting, "Setting")
    }

    pub async fn list_settings(&self) -> Result<Vec<Setting>, AppError> {
        let settings = sqlx::query_as::<_, Setting>(self.guard(SETTING_LIST)?)
            .bind(self.tenant.get())
            .fetch_all(&self.pool)
            .await?;
        self.confine(settings)
    }

    pub async fn delete_setting(&self, key: &str) -> Result<(), AppError> {
        let result = sqlx::query(self.guard(SETTING_DELETE)?)
            .bind(self.tenant.get())
            .bind(key.trim())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Setting not found".to_owned()));
        }
        Ok(())
    }
}
