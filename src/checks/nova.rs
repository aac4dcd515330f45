// Nova API local check
//
// Authenticates against the identity service (Keystone v3 password auth),
// looks up the compute endpoint in the returned catalog, points it at the
// local API address and then:
// 1. Times `GET <endpoint>/os-services`
// 2. Counts servers per status from `GET <endpoint>/servers/detail`
//
// A compute API that refuses the connection or answers with an HTTP error is
// reported as down rather than as a failed check.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{Check, CheckError, CheckReport};
use crate::maas::{Metric, MetricType};

/// Server statuses reported as `nova_servers_in_state_<STATUS>`
pub const SERVER_STATUSES: [&str; 3] = ["ACTIVE", "STOPPED", "ERROR"];

const STATUS_METRIC: &str = "nova_api_local_status";
const SUBJECT_TOKEN_HEADER: &str = "x-subject-token";
const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Password credentials for the identity service
#[derive(Clone)]
pub struct Credentials {
    /// Identity endpoint, e.g. `http://172.29.236.100:5000/v3`
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain_name: String,
    pub project_domain_name: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
struct CatalogEndpoint {
    interface: String,
    url: String,
}

#[derive(Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

#[derive(Deserialize)]
struct Server {
    status: String,
}

/// Nova API check against one local API address
///
/// # Outcomes
/// - Identity request fails or the catalog has no compute endpoint: `status error`
/// - Compute API unreachable or answering with an HTTP error: status metric at 0
/// - Otherwise: status metric at 1, response time of `os-services` and
///   server counts for each of `SERVER_STATUSES`
pub struct NovaApiLocalCheck {
    ip: Ipv4Addr,
    credentials: Credentials,
    timeout: Duration,
}

impl NovaApiLocalCheck {
    pub fn new(ip: Ipv4Addr, credentials: Credentials) -> Self {
        NovaApiLocalCheck {
            ip,
            credentials,
            timeout: Duration::from_secs(10),
        }
    }

    /// Overrides the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Requests a project-scoped token
    ///
    /// # Returns
    /// * `Ok((token, catalog))` - Token from the `X-Subject-Token` header and
    ///   the service catalog from the body
    async fn authenticate(&self, client: &Client) -> Result<(String, Vec<CatalogEntry>), CheckError> {
        let creds = &self.credentials;
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": creds.username,
                            "domain": { "name": creds.user_domain_name },
                            "password": creds.password
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": creds.project_name,
                        "domain": { "name": creds.project_domain_name }
                    }
                }
            }
        });

        let url = format!("{}/auth/tokens", creds.auth_url.trim_end_matches('/'));
        debug!("Requesting token from {}", url);
        let response = client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CheckError::Failed("Identity response carries no token".to_string()))?;
        let body: TokenResponse = response.json().await?;

        Ok((token, body.token.catalog))
    }

    /// Times `os-services` and counts servers by status
    async fn query_compute(
        &self,
        client: &Client,
        endpoint: &Url,
        token: &str,
    ) -> Result<(f64, Vec<Server>), reqwest::Error> {
        let base = endpoint.as_str().trim_end_matches('/');

        let start = Instant::now();
        client
            .get(format!("{}/os-services", base))
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let millis = start.elapsed().as_secs_f64() * 1000.0;

        let servers: ServerList = client
            .get(format!("{}/servers/detail", base))
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok((millis, servers.servers))
    }
}

/// Picks the compute endpoint (internal, else public) and swaps its host for `ip`
fn local_endpoint(catalog: &[CatalogEntry], ip: Ipv4Addr) -> Result<Url, CheckError> {
    let endpoints = catalog
        .iter()
        .find(|entry| entry.kind == "compute")
        .map(|entry| entry.endpoints.as_slice())
        .unwrap_or_default();
    let endpoint = ["internal", "public"]
        .iter()
        .find_map(|interface| endpoints.iter().find(|e| e.interface == *interface))
        .ok_or_else(|| CheckError::MissingEndpoint("compute".to_string()))?;

    let mut url = Url::parse(&endpoint.url)
        .map_err(|e| CheckError::Failed(format!("Invalid compute endpoint '{}': {}", endpoint.url, e)))?;
    url.set_ip_host(IpAddr::V4(ip))
        .map_err(|_| CheckError::Failed(format!("Compute endpoint '{}' has no host", endpoint.url)))?;
    Ok(url)
}

fn down_report() -> CheckReport {
    CheckReport::new().with_metric(Metric::boolean(STATUS_METRIC, false))
}

#[async_trait]
impl Check for NovaApiLocalCheck {
    fn name(&self) -> &str {
        "nova_api_local_check"
    }

    async fn run(&self) -> Result<CheckReport, CheckError> {
        let client = Client::builder().timeout(self.timeout).build()?;

        let (token, catalog) = self.authenticate(&client).await?;
        let endpoint = local_endpoint(&catalog, self.ip)?;
        debug!("Using compute endpoint {}", endpoint);

        let (millis, servers) = match self.query_compute(&client, &endpoint, &token).await {
            Ok(result) => result,
            Err(e) if e.is_decode() => return Err(e.into()),
            Err(e) => {
                match e.status() {
                    Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => {
                        warn!("nova API at {} rejected the token: {}", endpoint, e)
                    }
                    _ => warn!("nova API at {} is down: {}", endpoint, e),
                }
                return Ok(down_report());
            }
        };
        debug!("nova API answered in {:.3}ms with {} server(s)", millis, servers.len());

        let mut report = CheckReport::new()
            .with_metric(Metric::boolean(STATUS_METRIC, true))
            .with_metric(
                Metric::new("nova_api_local_response_time", MetricType::Uint32, format!("{:.3}", millis))
                    .with_unit("ms"),
            );
        for status in SERVER_STATUSES {
            let count = servers.iter().filter(|s| s.status == status).count();
            report.push(Metric::new(
                format!("nova_servers_in_state_{}", status),
                MetricType::Uint32,
                count,
            ));
        }

        Ok(report)
    }
}
