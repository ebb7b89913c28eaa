//! Central registry: the shared catalog of companies and their users.
//!
//! Functions that issue a single statement take any executor, so they work on
//! the pool or inside a transaction. Multi-statement writes take the
//! connection directly.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{SqliteConnection, SqliteExecutor};

use crate::{
    errors::AppError,
    structs::{Company, NewUser, PartitionMeta, User},
};

pub const COMPANY_TAKEN: &str = "company name already taken";
pub const EMAIL_TAKEN: &str = "email already registered";
pub const LOCATOR_TAKEN: &str = "company name conflicts with an existing partition";

pub const LOCATOR_PREFIX: &str = "tenant_";
const SLUG_MAX: usize = 40;

/// Maps a company name to its partition locator.
///
/// Total and deterministic: the ASCII-alphanumeric slug of the trimmed,
/// lowercased name (separator runs collapse to `_`) followed by the first four
/// bytes of its SHA-256. Names with no usable characters get the digest alone.
pub fn derive_partition_locator(name: &str) -> String {
    let normalized = name.trim().to_lowercase();

    let mut slug = String::with_capacity(SLUG_MAX + 1);
    let mut pending_sep = false;
    for c in normalized.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c);
            if slug.len() >= SLUG_MAX {
                break;
            }
        } else {
            pending_sep = true;
        }
    }

    let digest = Sha256::digest(normalized.as_bytes());
    let suffix = hex::encode(&digest[..4]);
    if slug.is_empty() {
        format!("{LOCATOR_PREFIX}{suffix}")
    } else {
        format!("{LOCATOR_PREFIX}{slug}_{suffix}")
    }
}

/// Turns a unique-constraint failure into the matching `Conflict`; everything
/// else is `Internal`.
fn conflict_or_internal(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            let message = db_err.message();
            log::info!("Uniqueness violation at write time: {}", message);
            let conflict = if message.contains("users.email") {
                EMAIL_TAKEN
            } else if message.contains("companies.partition_locator") {
                LOCATOR_TAKEN
            } else if message.contains("companies.name") {
                COMPANY_TAKEN
            } else {
                "record already exists"
            };
            return AppError::Conflict(conflict.to_owned());
        }
    }
    AppError::from(err)
}

pub async fn get_company_by_id<'e, E>(db: E, id: i64) -> Result<Option<Company>, AppError>
where
    E: SqliteExecutor<'e>,
{
    let company = sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?;
    Ok(company)
}

/// Case-insensitive on ASCII, like the column's uniqueness constraint.
pub async fn get_company_by_name<'e, E>(db: E, name: &str) -> Result<Option<Company>, AppError>
where
    E: SqliteExecutor<'e>,
{
    let company = sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE name = ?")
        .bind(name.trim())
        .fetch_optional(db)
        .await?;
    Ok(company)
}

pub async fn get_company_by_locator<'e, E>(
    db: E,
    locator: &str,
) -> Result<Option<Company>, AppError>
where
    E: SqliteExecutor<'e>,
{
    let company =
        sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE partition_locator = ?")
            .bind(locator)
            .fetch_optional(db)
            .await?;
    Ok(company)
}

/// Registers a company. Both the name and the derived locator must be unused;
/// a clash on either is a `Conflict`, whether found by the pre-check or raised
/// by the store when a concurrent insert wins the race.
pub async fn create_company(
    conn: &mut SqliteConnection,
    name: &str,
    meta: &PartitionMeta,
) -> Result<Company, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Company name is required".to_owned()));
    }
    let locator = derive_partition_locator(name);

    if get_company_by_name(&mut *conn, name).await?.is_some() {
        return Err(AppError::Conflict(COMPANY_TAKEN.to_owned()));
    }
    if let Some(existing) = get_company_by_locator(&mut *conn, &locator).await? {
        log::warn!(
            "Partition locator {} for {:?} collides with company {}",
            locator,
            name,
            existing.id
        );
        return Err(AppError::Conflict(LOCATOR_TAKEN.to_owned()));
    }

    let company = sqlx::query_as::<_, Company>(
        "INSERT INTO companies (name, partition_locator, db_url, db_key, created_at) VALUES (?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(name)
    .bind(&locator)
    .bind(&meta.db_url)
    .bind(&meta.db_key)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await
    .map_err(conflict_or_internal)?;

    log::info!(
        "Company created: id={} locator={}",
        company.id,
        company.partition_locator
    );
    Ok(company)
}

/// Global lookup: an email belongs to at most one company.
pub async fn get_user_by_email<'e, E>(db: E, email: &str) -> Result<Option<User>, AppError>
where
    E: SqliteExecutor<'e>,
{
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(db)
        .await?;
    Ok(user)
}

pub async fn get_user_in_company<'e, E>(
    db: E,
    email: &str,
    company_id: i64,
) -> Result<Option<User>, AppError>
where
    E: SqliteExecutor<'e>,
{
    let user =
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ? AND company_id = ?")
            .bind(email)
            .bind(company_id)
            .fetch_optional(db)
            .await?;
    Ok(user)
}

pub async fn get_user_by_id<'e, E>(db: E, id: i64) -> Result<Option<User>, AppError>
where
    E: SqliteExecutor<'e>,
{
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?;
    Ok(user)
}

pub async fn create_user(conn: &mut SqliteConnection, new: &NewUser) -> Result<User, AppError> {
    if get_user_by_email(&mut *conn, &new.email).await?.is_some() {
        return Err(AppError::Conflict(EMAIL_TAKEN.to_owned()));
    }

    let now = Utc::now();
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (company_id, email, full_name, pwd_hash, role, is_active, created_at, updated_at) VALUES (?, ?, ?, ?, ?, 1, ?, ?) RETURNING *",
    )
    .bind(new.company_id)
    .bind(&new.email)
    .bind(&new.full_name)
    .bind(&new.pwd_hash)
    .bind(new.role)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(conflict_or_internal)?;

    log::info!("User created: id={} company={}", user.id, user.company_id);
    Ok(user)
}

pub async fn record_login<'e, E>(db: E, user_id: i64, at: DateTime<Utc>) -> Result<(), AppError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query("UPDATE users SET last_login_at = ? WHERE id = ?")
        .bind(at)
        .bind(user_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Flips a user's active flag. The user must belong to `company_id`.
pub async fn set_user_active<'e, E>(
    db: E,
    company_id: i64,
    user_id: i64,
    active: bool,
) -> Result<User, AppError>
where
    E: SqliteExecutor<'e>,
{
    let user = sqlx::query_as::<_, User>(
        "UPDATE users SET is_active = ?, updated_at = ? WHERE id = ? AND company_id = ? RETURNING *",
    )
    .bind(active)
    .bind(Utc::now())
    .bind(user_id)
    .bind(company_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| AppError::NotFound("User not found".to_owned()))?;

    log::info!("User {} active={}", user.id, user.is_active);
    Ok(user)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use sqlx::SqlitePool;

    use super::*;
    use crate::{db, structs::Role};

    async fn pool() -> SqlitePool {
        db::connect_in_memory().await.unwrap()
    }

    fn admin(company_id: i64, email: &str) -> NewUser {
        NewUser {
            company_id,
            email: email.to_owned(),
            full_name: "A B".to_owned(),
            pwd_hash: "$argon2id$placeholder".to_owned(),
            role: Role::Admin,
        }
    }

    #[test]
    fn locator_slugs_the_name() {
        let locator = derive_partition_locator("  Acme Builders, Inc.  ");
        assert!(locator.starts_with("tenant_acme_builders_inc_"));
        assert_eq!(locator.len(), "tenant_acme_builders_inc_".len() + 8);
    }

    #[test]
    fn locator_ignores_case_and_surrounding_space() {
        assert_eq!(
            derive_partition_locator("ACME"),
            derive_partition_locator(" acme ")
        );
    }

    #[test]
    fn locator_separates_names_with_equal_slugs() {
        assert_ne!(
            derive_partition_locator("acme inc"),
            derive_partition_locator("acme-inc")
        );
    }

    #[test]
    fn locator_of_symbol_only_name_is_digest() {
        let locator = derive_partition_locator("日本!!");
        assert_eq!(locator.len(), LOCATOR_PREFIX.len() + 8);
        assert!(locator.starts_with(LOCATOR_PREFIX));
    }

    proptest! {
        #[test]
        fn locator_is_deterministic(name in ".*") {
            prop_assert_eq!(derive_partition_locator(&name), derive_partition_locator(&name));
        }

        #[test]
        fn locator_is_always_well_formed(name in ".*") {
            let locator = derive_partition_locator(&name);
            prop_assert!(locator.starts_with(LOCATOR_PREFIX));
            prop_assert!(locator
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
            prop_assert!(locator.len() <= LOCATOR_PREFIX.len() + SLUG_MAX + 10);
        }
    }

    #[tokio::test]
    async fn create_company_twice_conflicts() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let first = create_company(&mut conn, "Acme", &PartitionMeta::default()).await;
        let second = create_company(&mut conn, "Acme", &PartitionMeta::default()).await;

        let company = first.unwrap();
        assert_eq!(company.partition_locator, derive_partition_locator("Acme"));
        assert!(matches!(second, Err(AppError::Conflict(m)) if m == COMPANY_TAKEN));
    }

    #[tokio::test]
    async fn company_names_are_unique_regardless_of_case() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();

        create_company(&mut conn, "Acme", &PartitionMeta::default())
            .await
            .unwrap();
        let again = create_company(&mut conn, "ACME ", &PartitionMeta::default()).await;
        assert!(matches!(again, Err(AppError::Conflict(m)) if m == COMPANY_TAKEN));
    }

    #[tokio::test]
    async fn locator_collision_is_a_conflict() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();

        // NOCASE only folds ASCII, so these are distinct names with one locator.
        create_company(&mut conn, "ÄCME", &PartitionMeta::default())
            .await
            .unwrap();
        let clash = create_company(&mut conn, "äcme", &PartitionMeta::default()).await;
        assert!(matches!(clash, Err(AppError::Conflict(m)) if m == LOCATOR_TAKEN));
    }

    #[tokio::test]
    async fn store_constraint_is_translated_to_conflict() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let company = create_company(&mut conn, "Acme", &PartitionMeta::default())
            .await
            .unwrap();
        drop(conn);

        // Bypass the pre-check, as a concurrent writer would.
        let err = sqlx::query(
            "INSERT INTO companies (name, partition_locator, created_at) VALUES (?, ?, ?)",
        )
        .bind("acme")
        .bind("tenant_other")
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap_err();
        assert!(matches!(conflict_or_internal(err), AppError::Conflict(m) if m == COMPANY_TAKEN));
        assert!(get_company_by_id(&pool, company.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lookups_by_name_and_id_agree() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let meta = PartitionMeta {
            db_url: Some("sqlite://partitions/acme".into()),
            db_key: Some("k".into()),
        };
        let created = create_company(&mut conn, "Acme", &meta).await.unwrap();
        drop(conn);

        let by_name = get_company_by_name(&pool, "acme").await.unwrap().unwrap();
        let by_id = get_company_by_id(&pool, created.id).await.unwrap().unwrap();
        assert_eq!(by_name.id, by_id.id);
        assert_eq!(by_id.db_url.as_deref(), Some("sqlite://partitions/acme"));
        assert!(get_company_by_name(&pool, "Globex").await.unwrap().is_none());
        assert!(get_company_by_id(&pool, 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn email_is_unique_across_companies() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let acme = create_company(&mut conn, "Acme", &PartitionMeta::default())
            .await
            .unwrap();
        let globex = create_company(&mut conn, "Globex", &PartitionMeta::default())
            .await
            .unwrap();

        create_user(&mut conn, &admin(acme.id, "a@x.com")).await.unwrap();
        let dup = create_user(&mut conn, &admin(globex.id, "a@x.com")).await;
        assert!(matches!(dup, Err(AppError::Conflict(m)) if m == EMAIL_TAKEN));
    }

    #[tokio::test]
    async fn user_lookup_is_scoped_to_company() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let acme = create_company(&mut conn, "Acme", &PartitionMeta::default())
            .await
            .unwrap();
        let globex = create_company(&mut conn, "Globex", &PartitionMeta::default())
            .await
            .unwrap();
        create_user(&mut conn, &admin(acme.id, "a@x.com")).await.unwrap();
        drop(conn);

        assert!(get_user_in_company(&pool, "a@x.com", acme.id)
            .await
            .unwrap()
            .is_some());
        assert!(get_user_in_company(&pool, "a@x.com", globex.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn deactivation_requires_matching_company() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let acme = create_company(&mut conn, "Acme", &PartitionMeta::default())
            .await
            .unwrap();
        let globex = create_company(&mut conn, "Globex", &PartitionMeta::default())
            .await
            .unwrap();
        let user = create_user(&mut conn, &admin(acme.id, "a@x.com")).await.unwrap();
        drop(conn);

        let wrong = set_user_active(&pool, globex.id, user.id, false).await;
        assert!(matches!(wrong, Err(AppError::NotFound(_))));

        let updated = set_user_active(&pool, acme.id, user.id, false).await.unwrap();
        assert!(!updated.is_active);
    }

    #[tokio::test]
    async fn deleting_company_cascades_to_users() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let acme = create_company(&mut conn, "Acme", &PartitionMeta::default())
            .await
            .unwrap();
        let user = create_user(&mut conn, &admin(acme.id, "a@x.com")).await.unwrap();
        drop(conn);

        sqlx::query("DELETE FROM companies WHERE id = ?")
            .bind(acme.id)
            .execute(&pool)
            .await
            .unwrap();
        assert!(get_user_by_id(&pool, user.id).await.unwrap().is_none());
        assert!(get_company_by_id(&pool, acme.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_login_sets_timestamp() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let acme = create_company(&mut conn, "Acme", &PartitionMeta::default())
            .await
            .unwrap();
        let user = create_user(&mut conn, &admin(acme.id, "a@x.com")).await.unwrap();
        drop(conn);
        assert!(user.last_login_at.is_none());

        let at = Utc::now();
        record_login(&pool, user.id, at).await.unwrap();
        let reloaded = get_user_by_id(&pool, user.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_login_at.map(|t| t.timestamp()), Some(at.timestamp()));
    }
}
