//! Targeting engine: turns a target spec into an audience.
//!
//! `PRODUCT` audiences are precomputed off the hot path into `PENDING`
//! delivery rows, batched at `db_batch_size`.  The `(broadcast, user)`
//! uniqueness in the store makes a rerun (leader crash, scheduler overlap)
//! insert nothing twice.

use std::sync::Arc;

use beacon_core::directory::UserDirectory;
use beacon_core::error::CoreResult;
use beacon_core::store::BroadcastStore;
use beacon_protocol::{Broadcast, TargetSpec};
use tracing::debug;

use crate::lifecycle::dedup_preserving_order;

pub struct TargetingEngine {
    store: Arc<dyn BroadcastStore>,
    directory: Arc<dyn UserDirectory>,
    batch_size: usize,
}

impl TargetingEngine {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        directory: Arc<dyn UserDirectory>,
        batch_size: usize,
    ) -> Self {
        TargetingEngine {
            store,
            directory,
            batch_size: batch_size.max(1),
        }
    }

    /// Resolve the concrete audience for a target spec.
    pub async fn resolve(&self, target: &TargetSpec) -> CoreResult<Vec<String>> {
        match target {
            TargetSpec::All => self.directory.all_user_ids().await,
            TargetSpec::Role { role } => self.directory.users_with_role(role).await,
            TargetSpec::Product { product } => self.directory.product_subscribers(product).await,
            TargetSpec::Selected { user_ids } => Ok(dedup_preserving_order(user_ids)),
        }
    }

    /// Write one `PENDING` row per audience member, in batches.  Returns the
    /// number of rows actually inserted (zero on a rerun).
    pub async fn precompute(&self, broadcast: &Broadcast) -> CoreResult<u64> {
        let audience = self.resolve(&broadcast.target).await?;
        let mut inserted = 0u64;
        for chunk in audience.chunks(self.batch_size) {
            inserted += self
                .store
                .insert_delivery_batch(broadcast.id, chunk)
                .await?;
            debug!(
                broadcast_id = %broadcast.id,
                batch = chunk.len(),
                inserted,
                "precompute batch written"
            );
        }
        Ok(inserted)
    }
}
