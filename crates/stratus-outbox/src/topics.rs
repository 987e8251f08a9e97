// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Topic naming for resource events.
//!
//! Resource topics follow `{resource}.{provider}.{credential_id}.{region}.{action}`,
//! e.g. `network.aws.cred-456.ap-northeast-2.created`. The region segment is
//! left out when empty, which is the case for global resources.

/// Kubernetes clusters, node pools and nodes.
pub const RESOURCE_KUBERNETES: &str = "kubernetes";
/// VPCs, subnets and security groups.
pub const RESOURCE_NETWORK: &str = "network";
/// Virtual machines.
pub const RESOURCE_VM: &str = "vm";
/// Workspaces.
pub const RESOURCE_WORKSPACE: &str = "workspace";
/// Cloud credentials.
pub const RESOURCE_CREDENTIAL: &str = "credential";

/// Resource was created.
pub const ACTION_CREATED: &str = "created";
/// Resource was updated.
pub const ACTION_UPDATED: &str = "updated";
/// Resource was deleted.
pub const ACTION_DELETED: &str = "deleted";

/// Build `{resource}.{provider}.{credential_id}.{region}.{action}`.
pub fn resource_topic(
    resource: &str,
    provider: &str,
    credential_id: &str,
    region: &str,
    action: &str,
) -> String {
    if region.is_empty() {
        format!("{resource}.{provider}.{credential_id}.{action}")
    } else {
        format!("{resource}.{provider}.{credential_id}.{region}.{action}")
    }
}

/// Topic for VM events.
pub fn vm_topic(provider: &str, credential_id: &str, region: &str, action: &str) -> String {
    resource_topic(RESOURCE_VM, provider, credential_id, region, action)
}

/// Topic for network events of a kind such as `vpcs` or `security-groups`.
pub fn network_topic(
    provider: &str,
    credential_id: &str,
    region: &str,
    kind: &str,
    action: &str,
) -> String {
    resource_topic(
        RESOURCE_NETWORK,
        provider,
        credential_id,
        region,
        &format!("{kind}.{action}"),
    )
}

/// Topic for Kubernetes events of a kind such as `clusters`.
pub fn kubernetes_topic(
    provider: &str,
    credential_id: &str,
    region: &str,
    kind: &str,
    action: &str,
) -> String {
    resource_topic(
        RESOURCE_KUBERNETES,
        provider,
        credential_id,
        region,
        &format!("{kind}.{action}"),
    )
}

/// Topic for workspace events: `workspace.{workspace_id}.{action}`.
pub fn workspace_topic(workspace_id: &str, action: &str) -> String {
    format!("{RESOURCE_WORKSPACE}.{workspace_id}.{action}")
}

/// Topic for credential events: `credential.{workspace_id}.{provider}.{action}`.
pub fn credential_topic(workspace_id: &str, provider: &str, action: &str) -> String {
    format!("{RESOURCE_CREDENTIAL}.{workspace_id}.{provider}.{action}")
}

/// Event type for a resource action, e.g. `vm-created`.
pub fn event_type(resource: &str, action: &str) -> String {
    format!("{resource}-{action}")
}
