//! Multi-tenant identity and data isolation for a bid-management backend.
//!
//! A central registry maps each company to a partition locator and holds its
//! users; tenant-scoped records (projects, bidding documents, clients,
//! settings) are only reachable through a partition handle bound to one
//! company.

use std::sync::Arc;

use sqlx::SqlitePool;

pub mod analytics;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod db;
pub mod errors;
pub mod partition;
pub mod registry;
pub mod routes;
pub mod structs;

use config::Settings;
use credentials::CredentialStore;
use partition::PartitionStore;

#[derive(Debug, Clone)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub credentials: CredentialStore,
    pub partitions: PartitionStore,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, credentials: CredentialStore, settings: Settings) -> Self {
        Self {
            partitions: PartitionStore::new(db_pool.clone()),
            db_pool,
            credentials,
            settings: Arc::new(settings),
        }
    }
}
