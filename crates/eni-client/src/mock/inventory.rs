//! Inventory operations for MockProviderApi
//!
//! Handles subnets, interfaces and address assignment

use super::{lock, InjectedFailures, MockProviderApi};
use crate::error::ProviderError;
use crate::models::*;

/// Consume one injected failure for the selected operation, if any is left
fn take_failure(
    client: &MockProviderApi,
    select: impl FnOnce(&mut InjectedFailures) -> &mut u32,
) -> bool {
    let mut failures = lock(&client.failures);
    let remaining = select(&mut *failures);
    if *remaining > 0 {
        *remaining -= 1;
        true
    } else {
        false
    }
}

pub fn interfaces_of(client: &MockProviderApi, instance_id: &str) -> Vec<Interface> {
    let mut interfaces: Vec<Interface> = lock(&client.interfaces)
        .values()
        .filter(|interface| interface.instance_id == instance_id)
        .cloned()
        .collect();
    interfaces.sort_by_key(|interface| interface.index);
    interfaces
}

pub fn list_subnets(client: &MockProviderApi) -> Result<Vec<Subnet>, ProviderError> {
    lock(&client.calls).list_subnets += 1;
    if take_failure(client, |f| &mut f.list_subnets) {
        return Err(ProviderError::Api("injected list_subnets failure".to_string()));
    }

    Ok(lock(&client.subnets).values().cloned().collect())
}

pub fn list_interfaces(client: &MockProviderApi, instance_id: &str) -> Result<Vec<Interface>, ProviderError> {
    lock(&client.calls).list_interfaces += 1;
    if take_failure(client, |f| &mut f.list_interfaces) {
        return Err(ProviderError::Api("injected list_interfaces failure".to_string()));
    }

    Ok(interfaces_of(client, instance_id))
}

pub fn create_interface(client: &MockProviderApi, request: &CreateInterfaceRequest) -> Result<Interface, ProviderError> {
    lock(&client.calls).create_interface += 1;
    if take_failure(client, |f| &mut f.create_interface) {
        return Err(ProviderError::Api("injected create_interface failure".to_string()));
    }

    if !lock(&client.subnets).contains_key(&request.subnet_id) {
        return Err(ProviderError::NotFound(format!("Subnet {} not found", request.subnet_id)));
    }

    let mut interfaces = lock(&client.interfaces);
    let index_taken = interfaces
        .values()
        .any(|i| i.instance_id == request.instance_id && i.index == request.index);
    if index_taken {
        return Err(ProviderError::InvalidRequest(format!(
            "Instance {} already has an interface at index {}",
            request.instance_id, request.index
        )));
    }

    let interface = Interface {
        id: format!("eni-{}", uuid::Uuid::new_v4().simple()),
        instance_id: request.instance_id.clone(),
        subnet_id: request.subnet_id.clone(),
        index: request.index,
        addresses: Vec::new(),
        security_groups: request.security_groups.clone(),
    };
    interfaces.insert(interface.id.clone(), interface.clone());
    Ok(interface)
}

pub fn allocate_addresses(client: &MockProviderApi, interface_id: &str, count: u32) -> Result<Vec<AllocatedAddress>, ProviderError> {
    lock(&client.calls).allocate_addresses += 1;
    if take_failure(client, |f| &mut f.allocate_addresses) {
        return Err(ProviderError::Api("injected allocate_addresses failure".to_string()));
    }

    if count == 0 {
        return Err(ProviderError::InvalidRequest(format!(
            "zero addresses requested for interface {}",
            interface_id
        )));
    }

    let mut interfaces = lock(&client.interfaces);
    let interface = interfaces
        .get_mut(interface_id)
        .ok_or_else(|| ProviderError::NotFound(format!("Interface {} not found", interface_id)))?;

    {
        let mut subnets = lock(&client.subnets);
        let subnet = subnets
            .get_mut(&interface.subnet_id)
            .ok_or_else(|| ProviderError::NotFound(format!("Subnet {} not found", interface.subnet_id)))?;
        if subnet.available_addresses < count {
            return Err(ProviderError::SubnetExhausted(format!(
                "Subnet {} has {} addresses left, {} requested",
                subnet.id, subnet.available_addresses, count
            )));
        }
        subnet.available_addresses -= count;
    }

    let allocated: Vec<AllocatedAddress> = (0..count)
        .map(|_| AllocatedAddress {
            address: client.next_address(),
            interface_id: interface_id.to_string(),
        })
        .collect();
    interface
        .addresses
        .extend(allocated.iter().map(|a| a.address.clone()));

    Ok(allocated)
}
