//! In-memory [`IdentityDirectory`] and router fixtures.

#![allow(clippy::expect_used, clippy::panic)]

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::Router;
use parking_lot::RwLock;
use syfthub_authn::{KeyStore, TokenService};

use crate::{
    directory::{IdentityDirectory, UserIdentity, UserProfile},
    routes::{IdpState, router},
};

/// A registered user.
#[derive(Debug, Clone)]
struct UserEntry {
    identity: UserIdentity,
    profile: UserProfile,
}

/// Directory backed by in-memory maps of bearer credentials.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: RwLock<HashMap<String, UserEntry>>,
    sessions: RwLock<HashMap<String, String>>,
    services: RwLock<HashMap<String, String>>,
}

impl StaticDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user reachable with the bearer `session`.
    pub fn add_user(&self, id: &str, username: &str, role: &str, session: &str) {
        let entry = UserEntry {
            identity: UserIdentity { id: id.to_owned(), role: role.to_owned() },
            profile: UserProfile {
                email: format!("{username}@example.org"),
                username: username.to_owned(),
            },
        };
        self.users.write().insert(id.to_owned(), entry);
        self.sessions.write().insert(session.to_owned(), id.to_owned());
    }

    /// Deletes a user while leaving its sessions valid.
    pub fn remove_user(&self, id: &str) {
        self.users.write().remove(id);
    }

    /// Registers a service whose bearer `credential` authenticates as `audience`.
    pub fn add_service(&self, audience: &str, credential: &str) {
        self.services.write().insert(credential.to_owned(), audience.to_owned());
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn authenticate_user(&self, bearer: &str) -> Option<UserIdentity> {
        let id = self.sessions.read().get(bearer).cloned()?;
        self.users.read().get(&id).map(|entry| entry.identity.clone())
    }

    async fn authenticate_service(&self, bearer: &str) -> Option<String> {
        self.services.read().get(bearer).cloned()
    }

    async fn lookup_user(&self, subject: &str) -> Option<UserProfile> {
        self.users.read().get(subject).map(|entry| entry.profile.clone())
    }
}

/// Router over `key_store`, `tokens` and `directory`.
pub fn test_router(
    key_store: KeyStore,
    tokens: TokenService,
    directory: Arc<StaticDirectory>,
) -> Router {
    router(IdpState::new(Arc::new(key_store), Arc::new(tokens), directory))
}
