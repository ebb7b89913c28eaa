//! Password credentials.
//!
//! Credentials are Argon2id PHC strings: the salt and cost parameters travel
//! inside the string, so nothing else needs to be stored next to them.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

use crate::{config::Settings, errors::AppError};

const DECOY_PASSWORD: &str = "decoy credential for unknown accounts";

#[derive(Debug, Clone)]
pub struct CredentialStore {
    params: Params,
    /// Hashed with the live parameters, so checking it costs what a real
    /// check costs.
    decoy: String,
}

impl CredentialStore {
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, AppError> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| AppError::Config(format!("invalid password hashing parameters: {e}")))?;
        let mut store = Self {
            params,
            decoy: String::new(),
        };
        store.decoy = store.hash(DECOY_PASSWORD)?;
        Ok(store)
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        Self::new(
            settings.hash_memory_kib,
            settings.hash_iterations,
            settings.hash_parallelism,
        )
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, password: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);
        let credential = self
            .hasher()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| {
                log::error!("Failed to hash password: {}", e);
                AppError::from(e)
            })?
            .to_string();
        Ok(credential)
    }

    /// Checks `password` against a stored credential. A credential that does
    /// not parse never matches.
    pub fn verify(&self, password: &str, credential: &str) -> bool {
        match PasswordHash::new(credential) {
            Ok(parsed) => self
                .hasher()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                log::warn!("Stored credential is malformed: {}", e);
                false
            }
        }
    }

    /// [`hash`](Self::hash) on the blocking pool; takes the plaintext by value
    /// so it is dropped as soon as the hash is computed.
    pub async fn hash_blocking(&self, password: String) -> Result<String, AppError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.hash(&password)).await?
    }

    pub async fn verify_blocking(
        &self,
        password: String,
        credential: String,
    ) -> Result<bool, AppError> {
        let store = self.clone();
        let matched =
            tokio::task::spawn_blocking(move || store.verify(&password, &credential)).await?;
        Ok(matched)
    }

    /// Runs a full verification against the decoy credential and rejects.
    /// Used when there is no account to check, so that branch takes as long
    /// as a wrong password.
    pub async fn reject_blocking(&self, password: String) -> Result<(), AppError> {
        self.verify_blocking(password, self.decoy.clone()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_store() -> CredentialStore {
        CredentialStore::new(8, 1, 1).unwrap()
    }

    #[test]
    fn hash_round_trips_and_rejects_wrong_password() {
        let store = fast_store();
        let credential = store.hash("secret1").unwrap();
        assert!(credential.starts_with("$argon2id$"));
        assert!(!credential.contains("secret1"));
        assert!(store.verify("secret1", &credential));
        assert!(!store.verify("secret2", &credential));
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        let store = fast_store();
        let a = store.hash("secret1").unwrap();
        let b = store.hash("secret1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn credential_carries_its_own_parameters() {
        let strong = CredentialStore::new(64, 2, 1).unwrap();
        let credential = strong.hash("secret1").unwrap();
        assert!(fast_store().verify("secret1", &credential));
    }

    #[test]
    fn malformed_credential_never_matches() {
        assert!(!fast_store().verify("secret1", "plaintext-secret1"));
        assert!(!fast_store().verify("", ""));
    }

    #[test]
    fn rejects_impossible_parameters() {
        assert!(matches!(
            CredentialStore::new(0, 0, 0),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn decoy_uses_live_parameters() {
        let store = fast_store();
        assert!(store.decoy.starts_with("$argon2id$v=19$m=8,t=1,p=1$"));
        let strong = CredentialStore::new(64, 2, 1).unwrap();
        assert!(strong.decoy.starts_with("$argon2id$v=19$m=64,t=2,p=1$"));
    }

    #[tokio::test]
    async fn reject_pays_for_a_verification() {
        let store = fast_store();
        store.reject_blocking("secret1".to_owned()).await.unwrap();
        store.reject_blocking(DECOY_PASSWORD.to_owned()).await.unwrap();
    }

    #[tokio::test]
    async fn blocking_variants_agree_with_sync_ones() {
        let store = fast_store();
        let credential = store.hash_blocking("secret1".to_owned()).await.unwrap();
        assert!(store
            .verify_blocking("secret1".to_owned(), credential.clone())
            .await
            .unwrap());
        assert!(!store
            .verify_blocking("nope".to_owned(), credential)
            .await
            .unwrap());
    }
}
