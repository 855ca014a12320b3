//! Shared subnet inventory.
//!
//! All nodes draw addresses from the same set of subnets. The inventory keeps
//! the last subnet listing from the provider and a local remaining-address
//! counter per subnet. Nodes reserve addresses on the counter before calling
//! the provider, so concurrent allocations spread across subnets instead of
//! piling into the one that looked emptiest at the last listing.

use crate::error::ControllerError;
use eni_client::{ProviderApi, Subnet, Tags};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Listing {
    subnets: BTreeMap<String, Subnet>,
    refreshed_at: Option<Instant>,
}

/// Subnets known to the controller with their remaining-address counters
#[derive(Debug, Default)]
pub struct SubnetInventory {
    listing: RwLock<Listing>,
    // Serializes provider listings
    refresh_lock: Mutex<()>,
}

impl SubnetInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the inventory with a fresh listing from the provider
    pub async fn refresh(&self, provider: &dyn ProviderApi) -> Result<usize, ControllerError> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch(provider).await
    }

    /// Refresh the inventory if it is older than `max_age`.
    ///
    /// Concurrent callers wait for a single listing instead of each hitting
    /// the provider.
    pub async fn refresh_if_stale(&self, provider: &dyn ProviderApi, max_age: Duration) -> Result<(), ControllerError> {
        if !self.is_stale(max_age).await {
            return Ok(());
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited
        if !self.is_stale(max_age).await {
            return Ok(());
        }
        self.fetch(provider).await?;
        Ok(())
    }

    async fn is_stale(&self, max_age: Duration) -> bool {
        match self.listing.read().await.refreshed_at {
            Some(at) => at.elapsed() >= max_age,
            None => true,
        }
    }

    async fn fetch(&self, provider: &dyn ProviderApi) -> Result<usize, ControllerError> {
        let subnets = provider.list_subnets().await?;
        let count = subnets.len();

        let mut listing = self.listing.write().await;
        listing.subnets = subnets
            .into_iter()
            .map(|subnet| (subnet.id.clone(), subnet))
            .collect();
        listing.refreshed_at = Some(Instant::now());
        debug!("Subnet inventory refreshed: {} subnets", count);
        Ok(count)
    }

    /// Subnets an instance in `availability_zone`/`vpc_id` may use that still
    /// have addresses left, ordered by subnet ID
    pub async fn candidates(&self, availability_zone: &str, vpc_id: &str, required_tags: &Tags) -> Vec<Subnet> {
        self.listing
            .read()
            .await
            .subnets
            .values()
            .filter(|subnet| subnet.available_addresses > 0)
            .filter(|subnet| subnet.matches(availability_zone, vpc_id, required_tags))
            .cloned()
            .collect()
    }

    /// Current view of one subnet
    pub async fn get(&self, subnet_id: &str) -> Option<Subnet> {
        self.listing.read().await.subnets.get(subnet_id).cloned()
    }

    /// Take up to `count` addresses from a subnet's remaining counter.
    ///
    /// Returns the number actually reserved, which is 0 when the subnet is
    /// unknown or drained.
    pub async fn reserve(&self, subnet_id: &str, count: u32) -> u32 {
        let mut listing = self.listing.write().await;
        let Some(subnet) = listing.subnets.get_mut(subnet_id) else {
            return 0;
        };
        let granted = count.min(subnet.available_addresses);
        subnet.available_addresses -= granted;
        granted
    }

    /// Return addresses reserved by a failed or partial allocation
    pub async fn release(&self, subnet_id: &str, count: u32) {
        if count == 0 {
            return;
        }
        let mut listing = self.listing.write().await;
        if let Some(subnet) = listing.subnets.get_mut(subnet_id) {
            subnet.available_addresses = subnet.available_addresses.saturating_add(count);
            info!("Released {} reserved addresses back to subnet {}", count, subnet_id);
        }
    }
}
