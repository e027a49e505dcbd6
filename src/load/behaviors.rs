use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;

use super::template::{Template, parse_range};
use crate::behavior::{ActionContext, Behavior, BehaviorAction};
use crate::core::{Detail, FailureKind, Outcome, OutcomeKind};
use crate::http::{HttpRequest, parse_method};
use crate::session::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BehaviorSpec {
    pub name: String,
    pub weight: u32,
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default)]
    pub requests: Vec<RequestSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSpec {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<String>,
}

fn default_min_wait_ms() -> u64 {
    2_000
}

fn default_max_wait_ms() -> u64 {
    5_000
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone)]
struct CompiledRequest {
    name: String,
    method: Method,
    path: Template,
    body: Option<Template>,
    headers: Vec<(String, String)>,
    repeat: (u32, u32),
}

/// A behavior made of request templates. One invocation is one Outcome; it
/// succeeds only when every request answered 2xx.
#[derive(Debug, Clone)]
pub struct HttpBehavior {
    requests: Vec<CompiledRequest>,
    request_timeout: Duration,
}

struct Planned {
    name: String,
    method: Method,
    path: String,
    request: HttpRequest,
}

impl HttpBehavior {
    pub fn compile(spec: &BehaviorSpec, request_timeout: Duration) -> Result<Self, SessionError> {
        let err = |msg: String| {
            SessionError::configuration(format!("behavior `{}`: {msg}", spec.name))
        };
        if spec.requests.is_empty() {
            return Err(err("requests が空です".to_string()));
        }
        let mut requests = Vec::with_capacity(spec.requests.len());
        for r in &spec.requests {
            let method = parse_method(&r.method).map_err(err)?;
            let path = Template::parse(&r.path).map_err(err)?;
            let body = r
                .body
                .as_deref()
                .map(Template::parse)
                .transpose()
                .map_err(err)?;
            if let Some(body) = &body {
                let sample = body.expand(&mut rand::rng());
                serde_json::from_str::<serde_json::Value>(&sample).map_err(|e| {
                    err(format!("request `{}` の body が JSON ではありません: {e}", r.name))
                })?;
            }
            let repeat = match r.repeat.as_deref() {
                None => (1, 1),
                Some(text) => {
                    let (lo, hi) = parse_range(text).map_err(err)?;
                    let lo = u32::try_from(lo).map_err(|_| err(format!("repeat が不正です: {text}")))?;
                    let hi = u32::try_from(hi).map_err(|_| err(format!("repeat が不正です: {text}")))?;
                    (lo, hi)
                }
            };
            requests.push(CompiledRequest {
                name: r.name.clone(),
                method,
                path,
                body,
                headers: r.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                repeat,
            });
        }
        Ok(Self {
            requests,
            request_timeout,
        })
    }

    fn plan(&self, base: &crate::core::Target) -> Vec<Planned> {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut planned = Vec::new();
        for r in &self.requests {
            let times = rng.random_range(r.repeat.0..=r.repeat.1);
            for _ in 0..times {
                let path = r.path.expand(&mut rng);
                let mut request =
                    HttpRequest::new(r.method.clone(), base.url(&path), self.request_timeout);
                for (k, v) in &r.headers {
                    request = request.with_header(k.clone(), v.clone());
                }
                if let Some(body) = &r.body {
                    request = request.with_body(body.expand(&mut rng));
                }
                planned.push(Planned {
                    name: r.name.clone(),
                    method: r.method.clone(),
                    path,
                    request,
                });
            }
        }
        planned
    }
}

#[async_trait]
impl BehaviorAction for HttpBehavior {
    async fn run(&self, ctx: &ActionContext<'_>) -> Outcome {
        let planned = self.plan(ctx.target);

        let mut entries = Vec::with_capacity(planned.len());
        let mut transport_error: Option<String> = None;
        let mut bad_status: Option<(String, u16)> = None;
        let mut last_status = None;
        for p in planned {
            let started = Instant::now();
            let result = ctx.client.request(p.request).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            match result {
                Ok(resp) => {
                    last_status = Some(resp.status);
                    if !resp.is_success() && bad_status.is_none() {
                        bad_status = Some((p.name.clone(), resp.status));
                    }
                    entries.push(json!({
                        "name": p.name,
                        "method": p.method.as_str(),
                        "path": p.path,
                        "status": resp.status,
                        "elapsed_ms": elapsed_ms,
                    }));
                }
                Err(err) => {
                    if transport_error.is_none() {
                        transport_error = Some(format!("{}: {err}", p.name));
                    }
                    entries.push(json!({
                        "name": p.name,
                        "method": p.method.as_str(),
                        "path": p.path,
                        "elapsed_ms": elapsed_ms,
                        "error": err.to_string(),
                    }));
                }
            }
        }

        let mut detail = Detail::new();
        detail.insert("requests".to_string(), json!(entries));
        let outcome = match (transport_error, bad_status) {
            (Some(error), _) => Outcome::failed(
                OutcomeKind::Behavior,
                ctx.behavior,
                ctx.target.id.clone(),
                FailureKind::Transport,
                error,
            ),
            (None, Some((name, status))) => Outcome::failed(
                OutcomeKind::Behavior,
                ctx.behavior,
                ctx.target.id.clone(),
                FailureKind::UnexpectedStatus,
                format!("{name}: unexpected status {status}"),
            ),
            (None, None) => Outcome::succeeded(
                OutcomeKind::Behavior,
                ctx.behavior,
                ctx.target.id.clone(),
                None,
                Detail::new(),
            ),
        };
        outcome
            .with_detail(detail)
            .with_status_code(last_status)
            .with_actor(ctx.actor)
    }
}

pub fn build_behaviors(
    specs: &[BehaviorSpec],
    request_timeout: Duration,
) -> Result<Vec<Behavior>, SessionError> {
    let mut names: Vec<&str> = Vec::new();
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        if names.contains(&spec.name.as_str()) {
            return Err(SessionError::configuration(format!(
                "behavior 名が重複しています: {}",
                spec.name
            )));
        }
        names.push(&spec.name);
        let action = HttpBehavior::compile(spec, request_timeout)?;
        out.push(Behavior::new(
            spec.name.clone(),
            spec.weight,
            Duration::from_millis(spec.min_wait_ms),
            Duration::from_millis(spec.max_wait_ms),
            Arc::new(action),
        )?);
    }
    Ok(out)
}

pub(super) fn get(name: &str, path: &str) -> RequestSpec {
    RequestSpec {
        name: name.to_string(),
        method: "GET".to_string(),
        path: path.to_string(),
        body: None,
        headers: BTreeMap::new(),
        repeat: None,
    }
}

pub(super) fn post(name: &str, path: &str, body: &str) -> RequestSpec {
    RequestSpec {
        method: "POST".to_string(),
        body: Some(body.to_string()),
        ..get(name, path)
    }
}

pub(super) fn mix(name: &str, weight: u32, requests: Vec<RequestSpec>) -> BehaviorSpec {
    BehaviorSpec {
        name: name.to_string(),
        weight,
        min_wait_ms: default_min_wait_ms(),
        max_wait_ms: default_max_wait_ms(),
        requests,
    }
}

/// E-commerce mix driven through the API gateway.
pub fn default_behaviors() -> Vec<BehaviorSpec> {
    vec![
        mix(
            "browse_products",
            4,
            vec![
                get("products_list", "/product-service/api/products"),
                get("categories_list", "/product-service/api/categories"),
                get("product_detail", "/product-service/api/products/{int:1-4}"),
            ],
        ),
        mix(
            "manage_favourites",
            3,
            vec![
                get("favourites_list", "/favourite-service/api/favourites"),
                post(
                    "create_favourite",
                    "/favourite-service/api/favourites",
                    r#"{"userId": {int:1-5}, "productId": {int:1-4}, "likeDate": "{now}"}"#,
                ),
            ],
        ),
        mix(
            "manage_orders",
            2,
            vec![
                get("orders_list", "/order-service/api/orders"),
                get("order_detail", "/order-service/api/orders/{int:1-4}"),
                post("create_cart", "/order-service/api/carts", r#"{"userId": {int:1-5}}"#),
            ],
        ),
        mix(
            "manage_payments",
            2,
            vec![
                get("payments_list", "/payment-service/api/payments"),
                get("payment_detail", "/payment-service/api/payments/{int:1-4}"),
                post(
                    "create_payment",
                    "/payment-service/api/payments",
                    r#"{"isPayed": true, "paymentStatus": "COMPLETED", "order": {"orderId": {int:1-4}}}"#,
                ),
            ],
        ),
        mix(
            "manage_users",
            1,
            vec![
                get("users_list", "/user-service/api/users"),
                get("user_detail", "/user-service/api/users/{int:1-5}"),
            ],
        ),
    ]
}
