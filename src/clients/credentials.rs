use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::client::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::Deserialize;

use crate::crd::discovery::{KubeconfigRef, WorkloadIdentityRef};
use crate::crd::{ClusterRef, EnvironmentSpec};
use crate::error::{AppError, AppResult};
use crate::kubernetes::api::{with_timeout, CREDENTIAL_EXCHANGE_TIMEOUT};

const DEFAULT_KUBECONFIG_KEY: &str = "kubeconfig";
const PROJECTED_TOKEN_PATH: &str = "/var/run/secrets/tokens/agentregistry/token";
const STS_ENDPOINT: &str = "https://sts.googleapis.com/v1/token";
const STS_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const STS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";

/// Tokens are refreshed this long before the provider-reported expiry
const EXPIRY_MARGIN_SECS: i64 = 120;

/// How an environment's cluster client authenticates
#[derive(Clone, Debug, PartialEq)]
pub enum CredentialStrategy {
    /// The local cluster this process runs in
    InCluster,
    /// A kubeconfig stored in a Secret on the local cluster
    KubeconfigSecret(KubeconfigRef),
    /// Workload-identity federation against a managed remote cluster
    WorkloadIdentity(WorkloadIdentityRef),
}

impl CredentialStrategy {
    /// Workload identity wins over a kubeconfig ref when both are set; an
    /// environment without either is the local cluster.
    pub fn for_environment(env: &EnvironmentSpec) -> Self {
        if let Some(wi) = &env.cluster.workload_identity_ref {
            return CredentialStrategy::WorkloadIdentity(wi.clone());
        }
        if let Some(kc) = &env.cluster.kubeconfig_ref {
            return CredentialStrategy::KubeconfigSecret(kc.clone());
        }
        CredentialStrategy::InCluster
    }
}

/// A cluster-scoped bearer token plus when to stop trusting it
#[derive(Clone, Debug)]
pub struct ClusterToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl ClusterToken {
    /// Expired means past the provider expiry minus the safety margin;
    /// refresh happens lazily on the next call after this flips.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS)
    }
}

/// Connect-gateway endpoint for a managed cluster. Region wins over zone
/// when both are set.
pub fn gateway_url(project_number: &str, cluster: &ClusterRef) -> AppResult<String> {
    let location = cluster
        .region
        .as_deref()
        .or(cluster.zone.as_deref())
        .ok_or_else(|| {
            AppError::InvalidInput(format!(
                "cluster {} has neither region nor zone",
                cluster.name
            ))
        })?;
    Ok(format!(
        "https://connectgateway.googleapis.com/v1/projects/{}/locations/{}/gkeMemberships/{}",
        project_number, location, cluster.name
    ))
}

#[derive(Deserialize)]
struct StsResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: DateTime<Utc>,
}

/// Exchanges the pod's projected service-account JWT for a cluster-scoped
/// token: JWT -> federated STS token -> service-account access token.
pub async fn exchange_workload_identity(
    http: &reqwest::Client,
    wi: &WorkloadIdentityRef,
) -> AppResult<ClusterToken> {
    with_timeout(CREDENTIAL_EXCHANGE_TIMEOUT, "credential exchange", async {
        let subject_token = tokio::fs::read_to_string(PROJECTED_TOKEN_PATH)
            .await
            .map_err(|e| {
                AppError::CredentialExchange(format!(
                    "projected token at {} unreadable: {}",
                    PROJECTED_TOKEN_PATH, e
                ))
            })?;

        let audience = format!(
            "//iam.googleapis.com/projects/{}/locations/global/workloadIdentityPools/agentregistry/providers/kubernetes",
            wi.project_number
        );
        let sts: StsResponse = http
            .post(STS_ENDPOINT)
            .form(&[
                ("grant_type", STS_GRANT_TYPE),
                ("audience", audience.as_str()),
                ("scope", "https://www.googleapis.com/auth/cloud-platform"),
                ("requested_token_type", "urn:ietf:params:oauth:token-type:access_token"),
                ("subject_token_type", STS_TOKEN_TYPE),
                ("subject_token", subject_token.trim()),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AppError::CredentialExchange(format!("STS exchange rejected: {}", e)))?
            .json()
            .await?;

        let iam_url = format!(
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            wi.service_account
        );
        let generated: GenerateAccessTokenResponse = http
            .post(&iam_url)
            .bearer_auth(&sts.access_token)
            .json(&serde_json::json!({
                "scope": ["https://www.googleapis.com/auth/cloud-platform"],
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| {
                AppError::CredentialExchange(format!(
                    "token generation for {} rejected: {}",
                    wi.service_account, e
                ))
            })?
            .json()
            .await?;

        // The federated token's own expiry bounds the chain as well
        let sts_expiry = Utc::now() + ChronoDuration::seconds(sts.expires_in);
        Ok(ClusterToken {
            token: generated.access_token,
            expires_at: generated.expire_time.min(sts_expiry),
        })
    })
    .await
}

/// Builds a client for a cluster whose kubeconfig lives in a local Secret
pub async fn client_from_kubeconfig_secret(
    local: &Client,
    default_namespace: &str,
    kc: &KubeconfigRef,
) -> AppResult<Client> {
    let namespace = kc.namespace.as_deref().unwrap_or(default_namespace);
    let secrets: Api<Secret> = Api::namespaced(local.clone(), namespace);
    let secret = secrets.get(&kc.name).await.map_err(AppError::Kubernetes)?;

    let key = kc.key.as_deref().unwrap_or(DEFAULT_KUBECONFIG_KEY);
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| {
            AppError::KubernetesConfig(format!(
                "secret {}/{} has no key {:?}",
                namespace, kc.name, key
            ))
        })?;

    let kubeconfig: Kubeconfig = serde_yaml::from_slice(&bytes.0)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| AppError::KubernetesConfig(format!("kubeconfig invalid: {}", e)))?;

    Client::try_from(config)
        .map_err(|e| AppError::KubernetesConfig(format!("client construction failed: {}", e)))
}

/// Builds a client speaking to a managed remote cluster with a freshly
/// exchanged bearer token.
pub async fn client_from_workload_identity(
    http: &reqwest::Client,
    wi: &WorkloadIdentityRef,
    cluster: &ClusterRef,
) -> AppResult<(Client, ClusterToken)> {
    let token = exchange_workload_identity(http, wi).await?;

    let url = gateway_url(&wi.project_number, cluster)?;
    let uri = url
        .parse()
        .map_err(|e| AppError::KubernetesConfig(format!("gateway url invalid: {}", e)))?;

    let mut config = kube::Config::new(uri);
    config.default_namespace = cluster
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    config.auth_info.token = Some(token.token.clone().into());

    let client = Client::try_from(config)
        .map_err(|e| AppError::KubernetesConfig(format!("client construction failed: {}", e)))?;
    Ok((client, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn env_with(cluster: ClusterRef) -> EnvironmentSpec {
        EnvironmentSpec {
            name: "prod".to_string(),
            cluster,
            ..Default::default()
        }
    }

    #[test]
    fn strategy_defaults_to_in_cluster() {
        let env = env_with(ClusterRef::default());
        assert_eq!(
            CredentialStrategy::for_environment(&env),
            CredentialStrategy::InCluster
        );
    }

    #[test]
    fn workload_identity_wins_over_kubeconfig() {
        let wi = WorkloadIdentityRef {
            project_number: "12345".to_string(),
            service_account: "registry@proj.iam.gserviceaccount.com".to_string(),
        };
        let env = env_with(ClusterRef {
            name: "c".to_string(),
            kubeconfig_ref: Some(KubeconfigRef {
                name: "kc".to_string(),
                ..Default::default()
            }),
            workload_identity_ref: Some(wi.clone()),
            ..Default::default()
        });
        assert_eq!(
            CredentialStrategy::for_environment(&env),
            CredentialStrategy::WorkloadIdentity(wi)
        );
    }

    #[test]
    fn token_expiry_applies_the_safety_margin() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().expect("time");
        let token = ClusterToken {
            token: "t".to_string(),
            expires_at: now + ChronoDuration::seconds(EXPIRY_MARGIN_SECS + 1),
        };
        assert!(!token.is_expired(now));

        let nearly = ClusterToken {
            token: "t".to_string(),
            expires_at: now + ChronoDuration::seconds(EXPIRY_MARGIN_SECS - 1),
        };
        assert!(nearly.is_expired(now));
    }

    #[test]
    fn gateway_url_prefers_region_over_zone() {
        let cluster = ClusterRef {
            name: "prod-cluster".to_string(),
            region: Some("europe-west1".to_string()),
            zone: Some("europe-west1-b".to_string()),
            ..Default::default()
        };
        let url = gateway_url("12345", &cluster).expect("url");
        assert_eq!(
            url,
            "https://connectgateway.googleapis.com/v1/projects/12345/locations/europe-west1/gkeMemberships/prod-cluster"
        );
    }

    #[test]
    fn gateway_url_requires_a_location() {
        let cluster = ClusterRef {
            name: "c".to_string(),
            ..Default::default()
        };
        assert!(gateway_url("12345", &cluster).is_err());
    }
}
