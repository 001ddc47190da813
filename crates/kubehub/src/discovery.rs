//! GVK resolution and dynamic-object watchers.

use anyhow::{anyhow, Context, Result};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::info;

use crate::config::WatchConfig;
use crate::kube_engine::KubeEngine;
use crate::watcher::Watcher;

/// Parse "v1/Pod" or "apps/v1/Deployment".
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Find the served resource for a GVK; returns it with its namespaced flag.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar, matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn normalized(obj: &DynamicObject) -> serde_json::Value {
    let mut v = serde_json::to_value(obj).unwrap_or(serde_json::Value::Null);
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
    }
    v
}

/// Equality for dynamic objects that ignores bookkeeping-only metadata, so a
/// resync or a status-less rewrite does not count as a change.
pub fn dynamic_equals(a: &DynamicObject, b: &DynamicObject) -> bool {
    normalized(a) == normalized(b)
}

/// Build an idle watcher for a GVK key. A namespace is ignored for cluster-scoped kinds.
pub async fn dynamic_watcher(client: Client, gvk_key: &str, namespace: Option<&str>, config: WatchConfig) -> Result<Watcher<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let ns = if namespaced { namespace } else { None };
    let api: Api<DynamicObject> = match ns {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    let engine = KubeEngine::new(api).with_resync(config.resync_period);
    info!(gvk = %gvk_key, resource = %ar.plural, ns = %ns.unwrap_or("(all)"), "watcher prepared");
    let w = Watcher::builder(ar.plural.as_str(), ns, engine)
        .equals(dynamic_equals)
        .config(config)
        .build()?;
    Ok(w)
}
