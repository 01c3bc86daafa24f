//! HTTP client for the simulation service.
//!
//! Session auth is HTTP basic against `/authentication`; the session cookie
//! is kept by the client's cookie store. Simulations are asynchronous on the
//! service side: a POST returns a `Location` to poll, and the service answers
//! with `Retry-After` until the result is ready. Batches of more than one
//! candidate go out as a single multi-simulation whose children are polled
//! individually once the parent completes.
//!
//! Every request first takes a token from the shared [`RateLimiter`]. A 429
//! puts the limiter into cooldown for the advertised `Retry-After`.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use alphaforge_core::domain::{DataField, DataFieldKind, ExternalId, Operator, Settings};

use crate::config::ServiceConfig;
use crate::rate_limit::RateLimiter;
use crate::service::{
    ExternalRecord, FieldScope, ItemOutcome, ItemResult, PyramidCount, ResultQuery, ResultsPage,
    ServiceError, SimulationRequest, SimulationService,
};

const FIELD_PAGE: usize = 50;

/// Account credentials. `Debug` never prints the password.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Read credentials from the named environment variables.
    pub fn from_env(username_var: &str, password_var: &str) -> Result<Self, ServiceError> {
        let read = |var: &str| std::env::var(var).map_err(|_| ServiceError::MissingCredentials(var.to_string()));
        Ok(Self::new(read(username_var)?, read(password_var)?))
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

// ─── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SimulationPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    settings: &'a Settings,
    regular: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct SimulationStatus {
    #[serde(default)]
    alpha: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    children: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AlphasResponse {
    #[serde(default)]
    count: usize,
    #[serde(default)]
    results: Vec<AlphaRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlphaRecord {
    id: String,
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    regular: Option<RegularCode>,
    #[serde(default)]
    status: String,
    #[serde(rename = "is", default)]
    in_sample: Option<InSample>,
    #[serde(default)]
    date_created: Option<DateTime<Utc>>,
    #[serde(default)]
    date_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    date_submitted: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegularCode {
    code: String,
    #[serde(default)]
    operator_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct InSample {
    #[serde(default)]
    sharpe: Option<f64>,
    #[serde(default)]
    fitness: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FieldsResponse {
    #[serde(default)]
    count: usize,
    #[serde(default)]
    results: Vec<FieldRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldRecord {
    id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<NamedRef>,
    #[serde(default)]
    subcategory: Option<NamedRef>,
    region: String,
    delay: i64,
    universe: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coverage: f64,
    #[serde(default)]
    user_count: u64,
    #[serde(default)]
    alpha_count: u64,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PyramidsResponse {
    #[serde(default)]
    pyramids: Vec<PyramidRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PyramidRecord {
    region: String,
    delay: i64,
    category: NamedRef,
    #[serde(default)]
    alpha_count: u64,
}

// ─── Conversions ─────────────────────────────────────────────────────

fn item_outcome(status: &SimulationStatus) -> ItemOutcome {
    let state = status.status.as_deref().unwrap_or("").to_ascii_uppercase();
    match (state.as_str(), &status.alpha) {
        ("COMPLETE" | "WARNING", Some(alpha)) => ItemOutcome::Completed {
            external_id: ExternalId::new(alpha.as_str()),
        },
        ("ERROR" | "FAIL" | "FAILED", _) => ItemOutcome::Failed {
            reason: status.message.clone().unwrap_or_else(|| state.clone()),
        },
        _ => ItemOutcome::Unresolved {
            reason: format!("simulation status `{state}`"),
        },
    }
}

fn external_record(r: AlphaRecord) -> ExternalRecord {
    let (expression, operator_count) = match r.regular {
        Some(code) => (code.code, code.operator_count),
        None => (String::new(), None),
    };
    let (sharpe, fitness) = r.in_sample.map_or((None, None), |is| (is.sharpe, is.fitness));
    ExternalRecord {
        id: ExternalId::new(r.id),
        expression,
        settings: r.settings,
        status: r.status,
        sharpe,
        fitness,
        operator_count,
        date_created: r.date_created,
        date_modified: r.date_modified,
        date_submitted: r.date_submitted,
    }
}

/// Group-typed and unknown fields cannot be bound as inputs.
fn data_field(r: FieldRecord) -> Option<DataField> {
    let kind = match r.kind.to_ascii_uppercase().as_str() {
        "MATRIX" => DataFieldKind::Matrix,
        "VECTOR" => DataFieldKind::Vector,
        _ => return None,
    };
    Some(DataField {
        name: r.id,
        kind,
        region: r.region,
        universe: r.universe,
        delay: r.delay,
        category: r.category.map(|c| c.id).unwrap_or_default(),
        sub_category: r.subcategory.map(|c| c.id),
        description: r.description,
        coverage: r.coverage,
        user_count: r.user_count,
        alpha_count: r.alpha_count,
    })
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn transport_error(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout(e.to_string())
    } else {
        ServiceError::Network(e.to_string())
    }
}

// ─── Client ──────────────────────────────────────────────────────────

pub struct HttpSimulationClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
    limiter: Arc<RateLimiter>,
    poll_interval: Duration,
    max_poll: Duration,
}

impl HttpSimulationClient {
    pub fn new(config: &ServiceConfig, credentials: Credentials, limiter: Arc<RateLimiter>) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .cookie_store(true)
            .build()
            .map_err(|e| ServiceError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            limiter,
            poll_interval: config.poll_interval(),
            max_poll: config.max_poll(),
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// Send through the limiter and map non-success statuses.
    fn send(&self, request: RequestBuilder) -> Result<Response, ServiceError> {
        self.limiter.acquire();
        let resp = request.send().map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status {
            StatusCode::UNAUTHORIZED => Err(ServiceError::Unauthorized(resp.text().unwrap_or_default())),
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = retry_after(resp.headers()).unwrap_or(Duration::from_secs(60));
                self.limiter.cooldown(wait);
                Err(ServiceError::RateLimited {
                    retry_after_secs: wait.as_secs(),
                })
            }
            _ => Err(ServiceError::Status {
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            }),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ServiceError> {
        let resp = self.send(self.client.get(self.url(path)).query(query))?;
        resp.json::<T>()
            .map_err(|e| ServiceError::Protocol(format!("failed to parse {path}: {e}")))
    }

    /// GET `url` until the service stops answering with `Retry-After`.
    fn poll(&self, url: &str) -> Result<Value, ServiceError> {
        let deadline = Instant::now() + self.max_poll;
        loop {
            let resp = self.send(self.client.get(self.url(url)))?;
            if let Some(wait) = retry_after(resp.headers()) {
                if Instant::now() + wait > deadline {
                    return Err(ServiceError::Timeout(format!("gave up polling {url}")));
                }
                debug!(url, wait_secs = wait.as_secs_f64(), "result not ready");
                thread::sleep(wait);
                continue;
            }
            let text = resp.text().map_err(transport_error)?;
            if text.trim().is_empty() {
                if Instant::now() + self.poll_interval > deadline {
                    return Err(ServiceError::Timeout(format!("gave up polling {url}")));
                }
                thread::sleep(self.poll_interval);
                continue;
            }
            return serde_json::from_str(&text)
                .map_err(|e| ServiceError::Protocol(format!("failed to parse {url}: {e}")));
        }
    }

    fn poll_status(&self, url: &str) -> Result<SimulationStatus, ServiceError> {
        let value = self.poll(url)?;
        serde_json::from_value(value).map_err(|e| ServiceError::Protocol(format!("bad simulation status: {e}")))
    }

    fn post_simulation(&self, body: &Value) -> Result<String, ServiceError> {
        let resp = self.send(self.client.post(self.url("simulations")).json(body))?;
        resp.headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Protocol("simulation accepted without a Location header".into()))
    }
}

impl SimulationService for HttpSimulationClient {
    fn submit_batch(&self, batch: &[SimulationRequest]) -> Result<Vec<ItemResult>, ServiceError> {
        let payloads: Vec<SimulationPayload<'_>> = batch
            .iter()
            .map(|r| SimulationPayload {
                kind: "REGULAR",
                settings: &r.settings,
                regular: &r.expression,
            })
            .collect();

        match payloads.as_slice() {
            [] => Ok(Vec::new()),
            [single] => {
                let body = serde_json::to_value(single).map_err(|e| ServiceError::Protocol(e.to_string()))?;
                let location = self.post_simulation(&body)?;
                let status = self.poll_status(&location)?;
                Ok(vec![ItemResult {
                    candidate_id: batch[0].candidate_id,
                    outcome: item_outcome(&status),
                }])
            }
            many => {
                let body = serde_json::to_value(many).map_err(|e| ServiceError::Protocol(e.to_string()))?;
                let location = self.post_simulation(&body)?;
                let parent = self.poll_status(&location)?;

                if parent.children.len() != batch.len() {
                    warn!(
                        expected = batch.len(),
                        got = parent.children.len(),
                        status = parent.status.as_deref().unwrap_or(""),
                        "multi-simulation children mismatch"
                    );
                    let reason = parent
                        .message
                        .clone()
                        .unwrap_or_else(|| "multi-simulation returned no children".into());
                    return Ok(batch
                        .iter()
                        .map(|r| ItemResult {
                            candidate_id: r.candidate_id,
                            outcome: ItemOutcome::Unresolved { reason: reason.clone() },
                        })
                        .collect());
                }

                let mut out = Vec::with_capacity(batch.len());
                for (request, child) in batch.iter().zip(&parent.children) {
                    let outcome = match self.poll_status(&format!("simulations/{child}")) {
                        Ok(status) => item_outcome(&status),
                        Err(e) if e.needs_reauth() => return Err(e),
                        Err(e) => ItemOutcome::Unresolved { reason: e.to_string() },
                    };
                    out.push(ItemResult {
                        candidate_id: request.candidate_id,
                        outcome,
                    });
                }
                Ok(out)
            }
        }
    }

    fn fetch_results_page(&self, query: &ResultQuery, offset: usize, limit: usize) -> Result<ResultsPage, ServiceError> {
        let mut params: Vec<(&str, String)> = vec![
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
            ("order", "-dateCreated".into()),
        ];
        if let Some(from) = query.created_from {
            params.push(("dateCreated>", from.to_rfc3339()));
        }
        if let Some(to) = query.created_to {
            params.push(("dateCreated<", to.to_rfc3339()));
        }
        if let Some(ref status) = query.status {
            params.push(("status", status.clone()));
        }
        let resp: AlphasResponse = self.get_json("users/self/alphas", &params)?;
        Ok(ResultsPage {
            total: resp.count,
            items: resp.results.into_iter().map(external_record).collect(),
        })
    }

    fn fetch_pnl(&self, id: &ExternalId) -> Result<Value, ServiceError> {
        self.poll(&format!("alphas/{}/recordsets/pnl", id.as_str()))
    }

    fn list_operators(&self) -> Result<Vec<Operator>, ServiceError> {
        self.get_json("operators", &[])
    }

    fn list_fields(&self, scope: &FieldScope) -> Result<Vec<DataField>, ServiceError> {
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("instrumentType", "EQUITY".into()),
                ("region", scope.region.clone()),
                ("delay", scope.delay.to_string()),
                ("universe", scope.universe.clone()),
                ("limit", FIELD_PAGE.to_string()),
                ("offset", offset.to_string()),
            ];
            if let Some(ref dataset) = scope.dataset {
                params.push(("dataset.id", dataset.clone()));
            }
            let page: FieldsResponse = self.get_json("data-fields", &params)?;
            let n = page.results.len();
            out.extend(page.results.into_iter().filter_map(data_field));
            offset += n;
            if n == 0 || offset >= page.count {
                break;
            }
        }
        Ok(out)
    }

    fn pyramid_alpha_counts(&self) -> Result<Vec<PyramidCount>, ServiceError> {
        let resp: PyramidsResponse = self.get_json("users/self/activities/pyramid-alphas", &[])?;
        Ok(resp
            .pyramids
            .into_iter()
            .map(|p| PyramidCount {
                region: p.region,
                delay: p.delay,
                category: p.category.id,
                alpha_count: p.alpha_count,
            })
            .collect())
    }

    fn reauthenticate(&self) -> Result<(), ServiceError> {
        let request = self
            .client
            .post(self.url("authentication"))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password));
        self.send(request)?;
        debug!(user = self.credentials.username(), "authenticated");
        Ok(())
    }
}
