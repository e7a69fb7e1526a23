use std::future::Future;
use std::time::Duration;

use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams,
};
use kube::client::Client;
use serde::Serialize;

use crate::crd::{ManagedResource, MANAGER};
use crate::error::{AppError, AppResult};

/// Per-call deadlines. Every store or remote-cluster call runs under one of
/// these; a reconcile iteration never waits unboundedly.
pub const LOCAL_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const CREDENTIAL_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Conflicts are re-attempted inline this many times before falling back to
/// the scheduler's backoff path.
pub const CONFLICT_RETRY_BOUND: usize = 3;

/// Runs `fut` under `limit`, converting expiry into a categorized timeout
/// error.
pub async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!(
            "{} exceeded {}s",
            what,
            limit.as_secs()
        ))),
    }
}

/// Re-attempts `op` while it fails with a revision conflict, up to
/// [`CONFLICT_RETRY_BOUND`] times. The operation must re-read the object it
/// patches on every attempt; this helper only drives the loop.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempts = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempts < CONFLICT_RETRY_BOUND => {
                attempts += 1;
                log::debug!(
                    "Revision conflict, retrying ({}/{}): {}",
                    attempts,
                    CONFLICT_RETRY_BOUND,
                    e
                );
            }
            other => return other,
        }
    }
}

/// Serialize a typed object into a DynamicObject carrying its TypeMeta, so
/// translator output can be applied and deleted uniformly.
pub fn to_dynamic<T>(obj: &T, api_version: &str, kind: &str) -> AppResult<DynamicObject>
where
    T: Serialize,
{
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".to_string(), api_version.into());
        map.insert("kind".to_string(), kind.into());
    }
    let dynamic: DynamicObject = serde_json::from_value(value)?;
    Ok(dynamic)
}

/// GVKs of the workload kinds the deployment engine creates; the
/// managed-resource triple stores the kind alone. All three are
/// namespaced builtins, so object addressing never needs an API
/// discovery round-trip.
fn builtin_gvk(kind: &str) -> Option<GroupVersionKind> {
    match kind {
        "Deployment" => Some(GroupVersionKind::gvk("apps", "v1", "Deployment")),
        "Service" => Some(GroupVersionKind::gvk("", "v1", "Service")),
        "ConfigMap" => Some(GroupVersionKind::gvk("", "v1", "ConfigMap")),
        _ => None,
    }
}

/// Dynamic API route for one managed kind in a target namespace. A kind
/// outside the managed set means the caller is holding an object this
/// engine never produced.
fn managed_api(client: &Client, namespace: &str, kind: &str) -> AppResult<Api<DynamicObject>> {
    let gvk = builtin_gvk(kind).ok_or_else(|| {
        AppError::Internal(format!("kind {} is not managed by this engine", kind))
    })?;
    Ok(Api::namespaced_with(
        client.clone(),
        namespace,
        &ApiResource::from_gvk(&gvk),
    ))
}

/// Server-side apply of one translated workload object, creating or
/// updating it in place. Conflicts with other field managers are forced:
/// the translator output is the single source of truth for these objects.
pub async fn apply(client: &Client, ns: &str, obj: DynamicObject) -> AppResult<DynamicObject> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| AppError::InvalidInput("translated object has no name".to_string()))?;
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .ok_or_else(|| {
            AppError::InvalidInput(format!("translated object {} has no kind", name))
        })?;

    log::debug!("Applying {} {}/{}", kind, ns, name);

    managed_api(client, ns, &kind)?
        .patch(&name, &PatchParams::apply(MANAGER).force(), &Patch::Apply(obj))
        .await
        .map_err(AppError::Kubernetes)
}

/// Delete one tracked workload object. NotFound counts as success so the
/// finalizer path converges when objects are already gone.
pub async fn delete_managed_resource(client: &Client, managed: &ManagedResource) -> AppResult<()> {
    log::debug!(
        "Deleting {} {}/{}",
        managed.kind,
        managed.namespace,
        managed.name
    );

    let api = managed_api(client, &managed.namespace, &managed.kind)?;
    match api.delete(&managed.name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(AppError::Kubernetes(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ResourceExt;
    use std::cell::Cell;

    fn conflict() -> AppError {
        AppError::Kubernetes(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    #[tokio::test]
    async fn conflict_retry_recovers_within_bound() {
        let calls = Cell::new(0usize);
        let result: AppResult<&str> = retry_on_conflict(|| {
            calls.set(calls.get() + 1);
            let attempt = calls.get();
            async move {
                if attempt < 3 {
                    Err(conflict())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert!(matches!(result, Ok("done")));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn conflict_retry_gives_up_past_the_bound() {
        let calls = Cell::new(0usize);
        let result: AppResult<()> = retry_on_conflict(|| {
            calls.set(calls.get() + 1);
            async { Err(conflict()) }
        })
        .await;

        assert!(result.is_err());
        // initial attempt + CONFLICT_RETRY_BOUND retries
        assert_eq!(calls.get(), CONFLICT_RETRY_BOUND + 1);
    }

    #[tokio::test]
    async fn non_conflict_errors_pass_straight_through() {
        let calls = Cell::new(0usize);
        let result: AppResult<()> = retry_on_conflict(|| {
            calls.set(calls.get() + 1);
            async { Err(AppError::NotFound("gone".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn timeouts_surface_as_categorized_errors() {
        let result: AppResult<()> = with_timeout(Duration::from_millis(5), "slow call", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(AppError::Timeout(msg)) => assert!(msg.contains("slow call")),
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn to_dynamic_stamps_type_meta() {
        let cm = k8s_openapi::api::core::v1::ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some("cfg".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let dynamic = to_dynamic(&cm, "v1", "ConfigMap").expect("serialize");
        assert_eq!(dynamic.name_any(), "cfg");
        let types = dynamic.types.expect("types set");
        assert_eq!(types.kind, "ConfigMap");
        assert_eq!(types.api_version, "v1");
    }

    #[test]
    fn builtin_kinds_resolve_their_groups() {
        assert_eq!(
            builtin_gvk("Deployment").map(|g| g.group),
            Some("apps".to_string())
        );
        assert_eq!(builtin_gvk("Service").map(|g| g.group), Some(String::new()));
        assert!(builtin_gvk("CronJob").is_none());
    }
}
