//! Lifecycle Reconciler
//!
//! Drives an endpoint through create, start, stop and delete, keeping the
//! storage controller's resource definition and the HA daemon's promoter
//! configuration consistent. There is no shared transaction between the two:
//! every operation re-reads deployed state and compares it with the request,
//! so repeating an operation converges instead of duplicating work.
//!
//! One reconciler exists per endpoint type; the behavior is identical across
//! types and only the [`Endpoint`] capabilities differ.

use super::status::status_from_resources;
use super::wait::{any_in_use, none_in_use, ConditionWaiter, WaitConfig};
use crate::domain::model::{
    validate_volumes, ServiceState, VolumeConfig, CLUSTER_PRIVATE_VOLUME_NUMBER,
};
use crate::domain::ports::{
    DeployedState, HaConfigStoreRef, ResourceSpec, StorageClientRef, StoredConfig,
};
use crate::endpoints::Endpoint;
use crate::error::{Error, Result, ResultExt};
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Generic lifecycle reconciler for one endpoint type
pub struct Reconciler<E: Endpoint> {
    storage: StorageClientRef,
    store: HaConfigStoreRef,
    waiter: ConditionWaiter,
    _endpoint: PhantomData<fn() -> E>,
}

impl<E: Endpoint> Clone for Reconciler<E> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            store: self.store.clone(),
            waiter: self.waiter.clone(),
            _endpoint: PhantomData,
        }
    }
}

impl<E: Endpoint> Reconciler<E> {
    pub fn new(
        storage: StorageClientRef,
        store: HaConfigStoreRef,
        wait: WaitConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            storage,
            store,
            waiter: ConditionWaiter::new(wait, cancel),
            _endpoint: PhantomData,
        }
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Look up an endpoint by identity; `None` when no configuration exists
    pub async fn get(&self, id: &E::Id) -> Result<Option<E>> {
        let Some(stored) = self.find(id).await? else {
            return Ok(None);
        };
        let (endpoint, _) = self.load(&stored, &E::resource_name(id)).await?;
        Ok(Some(endpoint))
    }

    /// All endpoints of this type
    ///
    /// Configurations that cannot be reconstructed are logged and skipped.
    pub async fn list(&self) -> Result<Vec<E>> {
        let configs = self
            .store
            .list()
            .await
            .context("failed to list promoter configs")?;

        let mut endpoints = Vec::new();
        for stored in configs {
            let Some(resource) = E::parse_config_id(&stored.config.id) else {
                trace!("Ignoring config {}: not a {} config", stored.config.id, E::PROTOCOL);
                continue;
            };

            let deployed = match self.storage.deployed(resource).await {
                Ok(deployed) => deployed,
                Err(e) => {
                    warn!("Failed to read deployed state of {}: {}", resource, e);
                    DeployedState::default()
                }
            };

            match Self::reconstruct(&stored, &deployed) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => warn!("Skipping config {}: {}", stored.config.id, e),
            }
        }

        Ok(endpoints)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create the endpoint and start it
    ///
    /// An existing endpoint with the same identity and an identical shape is
    /// returned unchanged; any difference is a conflict.
    pub async fn create(&self, mut requested: E) -> Result<E> {
        requested.fill_defaults();
        requested.validate()?;

        let id = requested.id().clone();
        let config_id = E::config_id(&id);
        let resource = E::resource_name(&id);

        if let Some(agent_type) = E::EXCLUSIVE_AGENT {
            let configs = self
                .store
                .list()
                .await
                .context("failed to list promoter configs")?;
            if let Some(other) = configs
                .iter()
                .find(|c| c.config.id != config_id && c.config.has_agent_type(agent_type))
            {
                return Err(Error::Conflict(format!(
                    "a {} resource already exists under a different identity ({})",
                    E::PROTOCOL,
                    other.config.id
                )));
            }
        }

        if let Some(stored) = self.find(&id).await? {
            let (existing, _) = self.load(&stored, &resource).await?;
            if !existing.matches(&requested) {
                debug!("Existing {} {}: {:?}", E::PROTOCOL, id, existing);
                debug!("Requested {} {}: {:?}", E::PROTOCOL, id, requested);
                return Err(Error::Conflict(format!(
                    "resource {} already exists with incompatible config",
                    id
                )));
            }
            debug!("{} {} already exists", E::PROTOCOL, id);
            return Ok(existing);
        }

        info!("Creating {} {}", E::PROTOCOL, id);
        let deployment = self
            .storage
            .ensure_resource(&Self::resource_spec(&requested), false)
            .await
            .context(format!("failed to create resource {}", resource))?;

        let config = requested.to_promoter(&deployment.resources)?;
        self.store
            .ensure(&config)
            .await
            .context(format!("failed to create promoter config {}", config.id))?;

        self.start(&id).await?.ok_or_else(|| {
            Error::Internal(format!("promoter config {} vanished after creation", config_id))
        })
    }

    /// Let the HA daemon promote the endpoint and wait until it is in use
    pub async fn start(&self, id: &E::Id) -> Result<Option<E>> {
        let Some(stored) = self.find(id).await? else {
            return Ok(None);
        };
        let resource = E::resource_name(id);

        info!("Starting {} {}", E::PROTOCOL, id);
        self.store
            .attach(&stored.config)
            .await
            .context(format!("failed to attach promoter config {}", stored.config.id))?;
        self.waiter
            .wait_until(self.storage.as_ref(), &resource, any_in_use)
            .await
            .context(format!("failed to wait for {} to start", resource))?;

        self.get(id).await
    }

    /// Withdraw the endpoint from the HA daemon and wait until it is demoted
    pub async fn stop(&self, id: &E::Id) -> Result<Option<E>> {
        let Some(stored) = self.find(id).await? else {
            return Ok(None);
        };
        let resource = E::resource_name(id);

        info!("Stopping {} {}", E::PROTOCOL, id);
        self.store
            .detach(&stored.config)
            .await
            .context(format!("failed to detach promoter config {}", stored.config.id))?;
        self.waiter
            .wait_until(self.storage.as_ref(), &resource, none_in_use)
            .await
            .context(format!("failed to wait for {} to stop", resource))?;

        self.get(id).await
    }

    /// Remove the configuration, then the storage resource
    ///
    /// Deleting an endpoint that does not exist succeeds.
    pub async fn delete(&self, id: &E::Id) -> Result<()> {
        let config_id = E::config_id(id);
        let resource = E::resource_name(id);

        info!("Deleting {} {}", E::PROTOCOL, id);
        self.store
            .delete(&config_id)
            .await
            .context(format!("failed to delete promoter config {}", config_id))?;
        self.waiter
            .wait_until(self.storage.as_ref(), &resource, none_in_use)
            .await
            .context(format!("failed to wait for {} to stop", resource))?;

        match self.storage.delete_resource_definition(&resource).await {
            Err(e) if e.is_not_found() => {
                debug!("Resource definition {} already absent", resource);
                Ok(())
            }
            result => result.context(format!("failed to delete resource {}", resource)),
        }
    }

    // =========================================================================
    // Volume Management
    // =========================================================================
    //
    // Both operations read the configuration, modify it and write it back
    // without a version check. A concurrent writer in between is overwritten.

    /// Add a data volume to a stopped endpoint
    ///
    /// Re-adding an existing volume with the same size only re-persists the
    /// configuration.
    pub async fn add_volume(&self, id: &E::Id, volume: VolumeConfig) -> Result<Option<E>> {
        validate_volumes(std::slice::from_ref(&volume))?;

        let Some(stored) = self.find(id).await? else {
            return Ok(None);
        };
        let resource = E::resource_name(id);
        let (mut endpoint, deployed) = self.load(&stored, &resource).await?;

        let existing = endpoint
            .volumes()
            .iter()
            .find(|v| v.number == volume.number)
            .cloned();
        let placements = match existing {
            Some(existing) if existing.size_kib != volume.size_kib => {
                return Err(Error::Conflict(format!(
                    "existing volume has differing size: volume {} of {} is {} KiB, requested {} KiB",
                    volume.number, id, existing.size_kib, volume.size_kib
                )));
            }
            Some(_) => {
                debug!("Volume {} of {} already present", volume.number, id);
                deployed.resources
            }
            None => {
                if endpoint.status().service == ServiceState::Started {
                    return Err(Error::Conflict(
                        "cannot add volume while service is running".into(),
                    ));
                }
                info!("Adding volume {} to {} {}", volume.number, E::PROTOCOL, id);
                endpoint.volumes_mut().push(volume);
                endpoint.fill_defaults();
                endpoint.validate()?;

                self.storage
                    .ensure_resource(&Self::resource_spec(&endpoint), true)
                    .await
                    .context(format!("failed to reconcile resource {}", resource))?
                    .resources
            }
        };

        let config = endpoint.to_promoter(&placements)?;
        self.store
            .ensure(&config)
            .await
            .context(format!("failed to update promoter config {}", config.id))?;

        self.get(id).await
    }

    /// Remove a data volume from a stopped endpoint
    pub async fn delete_volume(&self, id: &E::Id, number: u32) -> Result<Option<E>> {
        if number == CLUSTER_PRIVATE_VOLUME_NUMBER {
            return Err(Error::Validation(format!(
                "volume {} is reserved",
                CLUSTER_PRIVATE_VOLUME_NUMBER
            )));
        }

        let Some(stored) = self.find(id).await? else {
            return Ok(None);
        };
        let resource = E::resource_name(id);
        let (mut endpoint, deployed) = self.load(&stored, &resource).await?;

        if endpoint.status().service == ServiceState::Started {
            return Err(Error::Conflict(
                "cannot delete volume while service is running".into(),
            ));
        }

        info!("Deleting volume {} of {} {}", number, E::PROTOCOL, id);
        match self.storage.delete_volume_definition(&resource, number).await {
            Err(e) if e.is_not_found() => {
                debug!("Volume definition {}/{} already absent", resource, number)
            }
            result => result.context(format!("failed to delete volume {} of {}", number, resource))?,
        }

        endpoint.volumes_mut().retain(|v| v.number != number);
        let mut placements = deployed.resources;
        for placement in &mut placements {
            placement.volumes.retain(|v| v.number != number);
        }

        let config = endpoint.to_promoter(&placements)?;
        self.store
            .ensure(&config)
            .await
            .context(format!("failed to update promoter config {}", config.id))?;

        self.get(id).await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn find(&self, id: &E::Id) -> Result<Option<StoredConfig>> {
        let config_id = E::config_id(id);
        self.store
            .find(&config_id)
            .await
            .context(format!("failed to fetch existing promoter config {}", config_id))
    }

    async fn load(&self, stored: &StoredConfig, resource: &str) -> Result<(E, DeployedState)> {
        let deployed = self
            .storage
            .deployed(resource)
            .await
            .context(format!("failed to fetch deployed state of {}", resource))?;
        let endpoint = Self::reconstruct(stored, &deployed)?;
        Ok((endpoint, deployed))
    }

    fn reconstruct(stored: &StoredConfig, deployed: &DeployedState) -> Result<E> {
        let mut endpoint = E::from_promoter(
            &stored.config,
            deployed.definition.as_ref(),
            &deployed.volume_definitions,
        )
        .context(format!("failed to decode promoter config {}", stored.config.id))?;

        endpoint.set_status(status_from_resources(
            stored.attached,
            deployed.definition.as_ref(),
            deployed.group.as_ref(),
            &deployed.resources,
        ));
        Ok(endpoint)
    }

    fn resource_spec(endpoint: &E) -> ResourceSpec {
        ResourceSpec {
            name: E::resource_name(endpoint.id()),
            resource_group: endpoint.resource_group().to_string(),
            volumes: endpoint.storage_volumes(),
            gross_size: endpoint.gross_size(),
            props: endpoint.definition_props(),
        }
    }
}
