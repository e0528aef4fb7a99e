use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;

use crate::ServerProvider;
use trafficguard_common::{ApiError, Server, ServerStatus, ServerTypeInfo};

pub const HETZNER_API_BASE: &str = "https://api.hetzner.cloud/v1";

/// Tuning knobs for the resilient client. Everything the retry loop depends on
/// lives here so tests can point at a local stub with millisecond timings.
#[derive(Debug, Clone)]
pub struct HetznerConfig {
    pub api_base: String,
    pub api_token: String,
    /// Shared ceiling for rate-limit and transient-failure attempts.
    pub retry_budget: u32,
    /// Base wait after a 429; doubles per attempt up to `backoff_cap`.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Base wait after a network-level failure; doubles per attempt.
    pub transient_backoff_base: Duration,
    /// Hard per-attempt timeout. Exceeding it counts as a network failure.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl HetznerConfig {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_base: HETZNER_API_BASE.to_string(),
            api_token: api_token.into(),
            retry_budget: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(60),
            transient_backoff_base: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Authenticated Hetzner Cloud client with bounded retry, exponential backoff
/// on rate limiting, and a hard per-attempt timeout. No business logic.
pub struct HetznerClient {
    client: Client,
    config: HetznerConfig,
}

impl HetznerClient {
    pub fn new(config: HetznerConfig) -> Result<Self, ApiError> {
        // Default reqwest client has no overall timeout. If the provider
        // stalls, a run would hang forever.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn rate_limit_delay(&self, attempt: u32) -> Duration {
        self.config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.config.backoff_cap)
    }

    fn transient_delay(&self, attempt: u32) -> Duration {
        self.config
            .transient_backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// One authenticated request per attempt, at most `retry_budget` attempts.
    ///
    /// 429 responses and network failures consume attempts from the same
    /// bounded counter; any other 4xx/5xx, and provider error objects embedded
    /// in a 2xx body, are terminal immediately.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.config.api_base, path);
        let budget = self.config.retry_budget;
        let mut last_error = String::from("no attempt made");

        for attempt in 0..budget {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.config.api_token)
                .header(reqwest::header::CONTENT_TYPE, "application/json");
            if let Some(body) = &payload {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        "[Hetzner API] {} {} failed (attempt {}/{}): {}",
                        method,
                        path,
                        attempt + 1,
                        budget,
                        last_error
                    );
                    if attempt + 1 < budget {
                        sleep(self.transient_delay(attempt)).await;
                    }
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = self.rate_limit_delay(attempt);
                tracing::warn!(
                    "[Hetzner API] rate limited on {} {}, waiting {:?} (attempt {}/{})",
                    method,
                    path,
                    wait,
                    attempt + 1,
                    budget
                );
                last_error = "rate limited (429)".to_string();
                if attempt + 1 < budget {
                    sleep(wait).await;
                }
                continue;
            }

            let status_code = status.as_u16();
            let text = match response.text().await {
                Ok(t) => t,
                Err(e) => {
                    // Body read failures are connection-level, same as a send error.
                    last_error = e.to_string();
                    if attempt + 1 < budget {
                        sleep(self.transient_delay(attempt)).await;
                    }
                    continue;
                }
            };

            if !status.is_success() {
                tracing::error!(
                    "❌ [Hetzner API] {} {} failed: status={} body={}",
                    method,
                    path,
                    status_code,
                    text
                );
                return Err(ApiError::Provider {
                    status: status_code,
                    message: text,
                });
            }

            let body: Value = if text.trim().is_empty() {
                Value::Null
            } else {
                match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        last_error = format!("invalid JSON body: {e}");
                        tracing::warn!(
                            "[Hetzner API] {} {} returned unparseable body (attempt {}/{})",
                            method,
                            path,
                            attempt + 1,
                            budget
                        );
                        if attempt + 1 < budget {
                            sleep(self.transient_delay(attempt)).await;
                        }
                        continue;
                    }
                }
            };

            // Hetzner sometimes reports failures as an error object inside an
            // HTTP 200. Normalize here so callers never inspect payload shape.
            if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown provider error")
                    .to_string();
                tracing::error!(
                    "❌ [Hetzner API] {} {} returned error object: {}",
                    method,
                    path,
                    message
                );
                return Err(ApiError::Provider {
                    status: status_code,
                    message,
                });
            }

            return Ok(body);
        }

        Err(ApiError::RetriesExhausted {
            attempts: budget,
            last_error,
        })
    }
}

fn parse_server(value: &Value) -> Result<Server, ApiError> {
    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .ok_or(ApiError::MissingField("server.id"))?;
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .map(ServerStatus::parse)
        .ok_or(ApiError::MissingField("server.status"))?;
    let server_type = value["server_type"]["name"]
        .as_str()
        .ok_or(ApiError::MissingField("server.server_type.name"))?
        .to_string();
    Ok(Server {
        id,
        name: value["name"].as_str().unwrap_or_default().to_string(),
        status,
        server_type,
        outgoing_traffic: value["outgoing_traffic"].as_u64().unwrap_or(0),
        included_traffic: value["included_traffic"].as_u64(),
    })
}

fn parse_server_type(value: &Value) -> Result<ServerTypeInfo, ApiError> {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or(ApiError::MissingField("server_type.name"))?
        .to_string();
    // Prices arrive as strings, one entry per location; any location's gross
    // monthly price is good enough for overage math.
    let monthly_price = value["prices"]
        .as_array()
        .and_then(|prices| prices.first())
        .and_then(|p| p["price_monthly"]["gross"].as_str())
        .and_then(|s| s.parse::<f64>().ok());
    Ok(ServerTypeInfo {
        name,
        cores: value["cores"].as_u64().unwrap_or(0) as u32,
        memory_gb: value["memory"].as_f64().unwrap_or(0.0),
        disk_gb: value["disk"].as_u64().unwrap_or(0),
        monthly_price,
    })
}

#[async_trait]
impl ServerProvider for HetznerClient {
    async fn list_servers(&self) -> Result<Vec<Server>, ApiError> {
        let body = self.execute(Method::GET, "/servers", None).await?;
        let servers = body["servers"]
            .as_array()
            .ok_or(ApiError::MissingField("servers"))?;
        servers.iter().map(parse_server).collect()
    }

    async fn get_server(&self, server_id: u64) -> Result<Server, ApiError> {
        let body = self
            .execute(Method::GET, &format!("/servers/{server_id}"), None)
            .await?;
        let server = body.get("server").ok_or(ApiError::MissingField("server"))?;
        parse_server(server)
    }

    async fn power_on(&self, server_id: u64) -> Result<(), ApiError> {
        self.execute(
            Method::POST,
            &format!("/servers/{server_id}/actions/poweron"),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn power_off(&self, server_id: u64) -> Result<(), ApiError> {
        self.execute(
            Method::POST,
            &format!("/servers/{server_id}/actions/poweroff"),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn change_server_type(
        &self,
        server_id: u64,
        server_type: &str,
        upgrade_disk: bool,
    ) -> Result<(), ApiError> {
        let payload = json!({
            "server_type": server_type,
            "upgrade_disk": upgrade_disk,
        });
        self.execute(
            Method::POST,
            &format!("/servers/{server_id}/actions/change_type"),
            Some(payload),
        )
        .await
        .map(|_| ())
    }

    async fn list_server_types(&self) -> Result<Vec<ServerTypeInfo>, ApiError> {
        let body = self.execute(Method::GET, "/server_types", None).await?;
        let types = body["server_types"]
            .as_array()
            .ok_or(ApiError::MissingField("server_types"))?;
        types.iter().map(parse_server_type).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(base: Duration, cap: Duration) -> HetznerClient {
        let mut config = HetznerConfig::new("test-token");
        config.backoff_base = base;
        config.backoff_cap = cap;
        HetznerClient::new(config).unwrap()
    }

    #[test]
    fn rate_limit_delay_doubles_and_caps() {
        let client = client_with(Duration::from_secs(5), Duration::from_secs(60));
        let delays: Vec<_> = (0..6).map(|a| client.rate_limit_delay(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(10));
        assert_eq!(delays[2], Duration::from_secs(20));
        assert_eq!(delays[3], Duration::from_secs(40));
        assert_eq!(delays[4], Duration::from_secs(60));
        assert_eq!(delays[5], Duration::from_secs(60));
        // Non-decreasing across the whole schedule.
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn transient_delay_is_exponential() {
        let client = client_with(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(client.transient_delay(0), Duration::from_secs(1));
        assert_eq!(client.transient_delay(1), Duration::from_secs(2));
        assert_eq!(client.transient_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn parse_server_reads_nested_type_name() {
        let value = json!({
            "id": 42,
            "name": "web-1",
            "status": "running",
            "server_type": { "name": "cx23", "cores": 2 },
            "outgoing_traffic": 123456,
            "included_traffic": 21990232555520u64,
        });
        let server = parse_server(&value).unwrap();
        assert_eq!(server.id, 42);
        assert_eq!(server.server_type, "cx23");
        assert_eq!(server.status, ServerStatus::Running);
        assert_eq!(server.outgoing_traffic, 123456);
        assert_eq!(server.included_traffic, Some(21990232555520));
    }

    #[test]
    fn parse_server_rejects_missing_type() {
        let value = json!({ "id": 42, "status": "off" });
        let err = parse_server(&value).unwrap_err();
        assert!(matches!(err, ApiError::MissingField(_)));
    }

    #[test]
    fn parse_server_type_reads_string_prices() {
        let value = json!({
            "name": "cx33",
            "cores": 4,
            "memory": 8.0,
            "disk": 80,
            "prices": [
                { "location": "fsn1", "price_monthly": { "gross": "6.8000" } }
            ]
        });
        let info = parse_server_type(&value).unwrap();
        assert_eq!(info.name, "cx33");
        assert_eq!(info.cores, 4);
        assert_eq!(info.monthly_price, Some(6.8));
    }
}
