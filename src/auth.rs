//! Registration and login.
//!
//! Stateless between calls: a successful register or login returns the
//! identity and the caller keeps it. Logout therefore has nothing to revoke
//! on the server; dropping the caller's session ends it, and a copied session
//! stays valid until it expires.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use validator::{Validate, ValidationError};

use crate::{
    config::Settings,
    credentials::CredentialStore,
    errors::AppError,
    registry::{self, COMPANY_TAKEN, EMAIL_TAKEN},
    structs::{Company, NewUser, PartitionMeta, PublicUser, Role},
};

pub const COMPANY_NOT_FOUND: &str = "Company not found";
/// Shared by unknown-email and wrong-password so responses do not reveal
/// which accounts exist.
pub const INVALID_CREDENTIALS: &str = "Invalid email or password";
pub const ACCOUNT_DISABLED: &str = "Account is disabled";
pub const NOT_AUTHENTICATED: &str = "Not authenticated";
pub const ADMIN_REQUIRED: &str = "Admin role required";

const NAME_MAX: usize = 200;

fn within_name_limit(value: &str) -> Result<(), ValidationError> {
    if value.chars().count() > NAME_MAX {
        return Err(ValidationError::new("length")
            .with_message(format!("Names must be at most {NAME_MAX} characters").into()));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 6, max = 128, message = "Password must be between 6 and 128 characters"))]
    pub password: String,
    #[validate(
        length(min = 1, message = "Company name is required"),
        custom(function = "within_name_limit")
    )]
    pub company_name: String,
    #[validate(
        length(min = 1, message = "Full name is required"),
        custom(function = "within_name_limit")
    )]
    pub full_name: String,
}

impl RegisterRequest {
    fn normalized(mut self) -> Self {
        self.email = self.email.trim().to_lowercase();
        self.company_name = self.company_name.trim().to_owned();
        self.full_name = self.full_name.trim().to_owned();
        self
    }
}

/// A further user for an existing company, added by one of its admins.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewMemberRequest {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 6, max = 128, message = "Password must be between 6 and 128 characters"))]
    pub password: String,
    #[validate(
        length(min = 1, message = "Full name is required"),
        custom(function = "within_name_limit")
    )]
    pub full_name: String,
}

impl NewMemberRequest {
    fn normalized(mut self) -> Self {
        self.email = self.email.trim().to_lowercase();
        self.full_name = self.full_name.trim().to_owned();
        self
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "All fields are required"))]
    pub email: String,
    #[validate(length(min = 1, message = "All fields are required"))]
    pub password: String,
    #[validate(length(min = 1, message = "All fields are required"))]
    pub company: String,
}

impl LoginRequest {
    fn normalized(mut self) -> Self {
        self.email = self.email.trim().to_lowercase();
        self.company = self.company.trim().to_owned();
        self
    }
}

/// The authenticated user and the company whose partition they work in.
#[derive(Debug, Clone, Serialize)]
pub struct AuthIdentity {
    pub user: PublicUser,
    pub company: Company,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogoutAck {
    pub success: bool,
}

/// Connection metadata for a new company's partition, addressed by its locator.
pub fn partition_meta(settings: &Settings, company_name: &str) -> PartitionMeta {
    let locator = registry::derive_partition_locator(company_name);
    PartitionMeta {
        db_url: Some(format!(
            "{}/{}",
            settings.partition_base_url.trim_end_matches('/'),
            locator
        )),
        db_key: Some(settings.partition_key.clone()).filter(|k| !k.is_empty()),
    }
}

/// Creates a company with its first user, an active admin.
///
/// Both uniqueness checks run before anything is written, and the two inserts
/// share one transaction: if the user cannot be created the company is rolled
/// back with it.
pub async fn register(
    pool: &SqlitePool,
    credentials: &CredentialStore,
    meta: PartitionMeta,
    request: RegisterRequest,
) -> Result<AuthIdentity, AppError> {
    let request = request.normalized();
    request.validate()?;

    if registry::get_user_by_email(pool, &request.email)
        .await?
        .is_some()
    {
        log::info!("Registration refused: email already registered");
        return Err(AppError::Conflict(EMAIL_TAKEN.to_owned()));
    }
    if registry::get_company_by_name(pool, &request.company_name)
        .await?
        .is_some()
    {
        log::info!(
            "Registration refused: company {:?} exists",
            request.company_name
        );
        return Err(AppError::Conflict(COMPANY_TAKEN.to_owned()));
    }

    let RegisterRequest {
        email,
        password,
        company_name,
        full_name,
    } = request;
    let pwd_hash = credentials.hash_blocking(password).await?;

    let mut tx = pool.begin().await?;
    let company = registry::create_company(&mut tx, &company_name, &meta).await?;
    let user = registry::create_user(
        &mut tx,
        &NewUser {
            company_id: company.id,
            email,
            full_name,
            pwd_hash,
            role: Role::Admin,
        },
    )
    .await?;
    tx.commit().await?;

    log::info!(
        "Registered company {} ({}) with admin user {}",
        company.id,
        company.partition_locator,
        user.id
    );
    Ok(AuthIdentity {
        user: user.into(),
        company,
    })
}

pub async fn login(
    pool: &SqlitePool,
    credentials: &CredentialStore,
    request: LoginRequest,
) -> Result<AuthIdentity, AppError> {
    let request = request.normalized();
    request.validate()?;

    let company = registry::get_company_by_name(pool, &request.company)
        .await?
        .ok_or_else(|| {
            log::warn!("Login failed: unknown company {:?}", request.company);
            AppError::Unauthorized(COMPANY_NOT_FOUND.to_owned())
        })?;

    let Some(user) = registry::get_user_in_company(pool, &request.email, company.id).await? else {
        credentials.reject_blocking(request.password).await?;
        log::warn!("Login failed: no such user in company {}", company.id);
        return Err(AppError::Unauthorized(INVALID_CREDENTIALS.to_owned()));
    };

    let matched = credentials
        .verify_blocking(request.password, user.pwd_hash.clone())
        .await?;
    if !matched {
        log::warn!("Login failed: wrong password for user {}", user.id);
        return Err(AppError::Unauthorized(INVALID_CREDENTIALS.to_owned()));
    }

    if !user.is_active {
        log::warn!("Login refused: user {} is disabled", user.id);
        return Err(AppError::Unauthorized(ACCOUNT_DISABLED.to_owned()));
    }

    let mut user = user;
    let now = Utc::now();
    match registry::record_login(pool, user.id, now).await {
        Ok(()) => user.last_login_at = Some(now),
        // Best-effort: a missed timestamp must not turn away a valid login.
        Err(e) => log::error!("Failed to record login for user {}: {}", user.id, e),
    }

    log::info!("User {} logged in to company {}", user.id, company.id);
    Ok(AuthIdentity {
        user: user.into(),
        company,
    })
}

pub fn logout() -> LogoutAck {
    LogoutAck { success: true }
}

/// Resolves a session's user id back to a live identity.
pub async fn current_identity(pool: &SqlitePool, user_id: i64) -> Result<AuthIdentity, AppError> {
    let user = registry::get_user_by_id(pool, user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized(NOT_AUTHENTICATED.to_owned()))?;
    if !user.is_active {
        return Err(AppError::Unauthorized(ACCOUNT_DISABLED.to_owned()));
    }
    let company = registry::get_company_by_id(pool, user.company_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized(NOT_AUTHENTICATED.to_owned()))?;
    Ok(AuthIdentity {
        user: user.into(),
        company,
    })
}

fn require_admin(actor: &AuthIdentity, action: &str) -> Result<(), AppError> {
    if actor.user.role != Role::Admin {
        log::warn!(
            "User {} attempted to {} without admin role",
            actor.user.id,
            action
        );
        return Err(AppError::Forbidden(ADMIN_REQUIRED.to_owned()));
    }
    Ok(())
}

/// Adds an active member to the actor's company. Emails stay globally unique.
pub async fn add_member(
    pool: &SqlitePool,
    credentials: &CredentialStore,
    actor: &AuthIdentity,
    request: NewMemberRequest,
) -> Result<PublicUser, AppError> {
    require_admin(actor, "add a user")?;
    let request = request.normalized();
    request.validate()?;

    if registry::get_user_by_email(pool, &request.email)
        .await?
        .is_some()
    {
        return Err(AppError::Conflict(EMAIL_TAKEN.to_owned()));
    }

    let NewMemberRequest {
        email,
        password,
        full_name,
    } = request;
    let pwd_hash = credentials.hash_blocking(password).await?;

    let mut conn = pool.acquire().await?;
    let user = registry::create_user(
        &mut conn,
        &NewUser {
            company_id: actor.company.id,
            email,
            full_name,
            pwd_hash,
            role: Role::Member,
        },
    )
    .await?;

    log::info!(
        "User {} added member {} to company {}",
        actor.user.id,
        user.id,
        actor.company.id
    );
    Ok(user.into())
}

/// Administrative (de)activation of a user in the actor's own company.
pub async fn set_user_active(
    pool: &SqlitePool,
    actor: &AuthIdentity,
    user_id: i64,
    active: bool,
) -> Result<PublicUser, AppError> {
    require_admin(actor, "change account state")?;
    if actor.user.id == user_id && !active {
        return Err(AppError::Validation(
            "You cannot disable your own account".to_owned(),
        ));
    }
    let user = registry::set_user_active(pool, actor.company.id, user_id, active).await?;
    Ok(user.into())
}
