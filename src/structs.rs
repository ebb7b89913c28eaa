use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

#[derive(Deserialize, Serialize, Debug, Clone, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub partition_locator: String,
    pub db_url: Option<String>,
    #[serde(skip_serializing)]
    pub db_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Connection metadata for the store backing a company's partition.
#[derive(Debug, Clone, Default)]
pub struct PartitionMeta {
    pub db_url: Option<String>,
    pub db_key: Option<String>,
}

/// Central user row. Holds the credential, so it never leaves the server;
/// callers get a [`PublicUser`].
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub company_id: i64,
    pub email: String,
    pub full_name: String,
    pub pwd_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: i64,
    pub company_id: i64,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for PublicUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            company_id: user.company_id,
            email: user.email,
            full_name: user.full_name,
            role: user.role,
            is_active: user.is_active,
            last_login_at: user.last_login_at,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub company_id: i64,
    pub email: String,
    pub full_name: String,
    pub pwd_hash: String,
    pub role: Role,
}

#[derive(Deserialize, Serialize, Debug, Clone, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub tenant_id: i64,
    pub title: String,
    pub reference_number: Option<String>,
    pub agency: Option<String>,
    pub category: Option<String>,
    pub procurement_mode: Option<String>,
    /// Free text as entered; parsed leniently by the dashboard.
    pub budget: Option<String>,
    pub closing_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone, Default, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    #[validate(length(min = 1, max = 300, message = "Project title is required"))]
    pub title: String,
    pub reference_number: Option<String>,
    pub agency: Option<String>,
    pub category: Option<String>,
    pub procurement_mode: Option<String>,
    pub budget: Option<String>,
    pub closing_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BiddingDocument {
    pub id: i64,
    pub tenant_id: i64,
    pub project_id: i64,
    pub title: String,
    pub doc_type: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone, Default, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewBiddingDocument {
    pub project_id: i64,
    #[validate(length(min = 1, max = 300, message = "Document title is required"))]
    pub title: String,
    pub doc_type: Option<String>,
    #[serde(default)]
    pub content: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub contact_person: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone, Default, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewClient {
    #[validate(length(min = 1, max = 200, message = "Client name is required"))]
    pub name: String,
    pub contact_person: Option<String>,
    #[validate(email(message = "Invalid client email address"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub tenant_id: i64,
    #[sqlx(rename = "setting_key")]
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}
