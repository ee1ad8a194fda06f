//! User-directory interface.
//!
//! The directory is an external collaborator; the pipeline only needs
//! audience resolution.  `StaticDirectory` is the in-process backend used by
//! tests and single-node deployments, seeded at startup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CoreResult;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn all_user_ids(&self) -> CoreResult<Vec<String>>;
    async fn users_with_role(&self, role: &str) -> CoreResult<Vec<String>>;
    async fn product_subscribers(&self, product: &str) -> CoreResult<Vec<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub roles: HashSet<String>,
    pub products: HashSet<String>,
}

#[derive(Default, Clone)]
pub struct StaticDirectory {
    users: Arc<RwLock<HashMap<String, UserProfile>>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_user(&self, user_id: &str, roles: &[&str], products: &[&str]) {
        self.users.write().await.insert(
            user_id.to_owned(),
            UserProfile {
                roles: roles.iter().map(|r| (*r).to_owned()).collect(),
                products: products.iter().map(|p| (*p).to_owned()).collect(),
            },
        );
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn all_user_ids(&self) -> CoreResult<Vec<String>> {
        let mut ids: Vec<String> = self.users.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn users_with_role(&self, role: &str) -> CoreResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .users
            .read()
            .await
            .iter()
            .filter(|(_, profile)| profile.roles.contains(role))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn product_subscribers(&self, product: &str) -> CoreResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .users
            .read()
            .await
            .iter()
            .filter(|(_, profile)| profile.products.contains(product))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
