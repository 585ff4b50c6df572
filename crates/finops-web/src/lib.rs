//! Axum JSON admin API over the finops pipelines.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path as AxumPath, Query, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use finops_core::{InvoiceKind, InvoiceStatus};
use finops_integrations::{InvoiceFilter, LedgerError, NewPayment};
use finops_recon::{
    budget::maybe_build_scheduler, BudgetMonth, BulkRequest, ClearingRequest, FinopsConfig, FinopsService,
    OpsError, PurgeRequest, ToolError, ToolRegistry,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "finops-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FinopsService>,
    pub tools: Arc<ToolRegistry>,
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(service: Arc<FinopsService>) -> Self {
        let admin_token = service.config().admin_token.clone();
        Self {
            tools: Arc::new(ToolRegistry::new(service.clone())),
            service,
            admin_token,
        }
    }
}

/// A JSON `{"error": ...}` response.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<OpsError> for HttpError {
    fn from(err: OpsError) -> Self {
        let status = match &err {
            OpsError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            OpsError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            OpsError::Ledger(LedgerError::NotFound { .. }) => StatusCode::NOT_FOUND,
            OpsError::Ledger(_) => StatusCode::BAD_GATEWAY,
            OpsError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<ToolError> for HttpError {
    fn from(err: ToolError) -> Self {
        let message = err.to_string();
        match err {
            ToolError::UnknownTool(_) => Self::new(StatusCode::NOT_FOUND, message),
            ToolError::InvalidArguments { .. } => Self::bad_request(message),
            ToolError::Failed(inner) => inner.into(),
        }
    }
}

impl From<JsonRejection> for HttpError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for HttpError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

type ApiResult = Result<Json<Value>, HttpError>;

fn to_json<T: serde::Serialize>(value: &T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let api = Router::new()
        .route("/api/xero/invoices", get(list_invoices_handler))
        .route("/api/xero/invoices/bulk", post(bulk_handler))
        .route("/api/xero/clearing/reconcile", post(reconcile_handler))
        .route("/api/xero/accounts/{id}/purge", post(purge_handler))
        .route("/api/xero/payments/restore", post(restore_handler))
        .route("/api/budget/sync", post(budget_sync_handler))
        .route("/api/budget/summary", get(budget_summary_handler))
        .route("/api/tools", get(tools_handler))
        .route("/api/tools/{name}", post(tool_call_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_token));

    Router::new()
        .route("/health", get(health_handler))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    if state.admin_token.is_none() {
        warn!("FINOPS_ADMIN_TOKEN is not set; every /api route will answer 401");
    }
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "finops admin api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = FinopsConfig::from_env();
    let port = config.web_port;
    let scheduler_enabled = config.budget_scheduler_enabled;
    let cron = config.budget_sync_cron.clone();
    let service = Arc::new(FinopsService::from_config(config)?);

    let _scheduler = match service.budget() {
        Some(sync) => {
            let sched = maybe_build_scheduler(sync, scheduler_enabled, &cron).await?;
            if let Some(sched) = &sched {
                sched.start().await?;
                info!(%cron, "budget sync scheduler started");
            }
            sched
        }
        None => None,
    };
    serve(AppState::new(service), port).await
}

async fn require_admin_token(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match (state.admin_token.as_deref(), presented) {
        (Some(expected), Some(token)) if token == expected => next.run(request).await,
        _ => HttpError::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response(),
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok", "service": CRATE_NAME}))
}

#[derive(Debug, Default, Deserialize)]
struct InvoicesQuery {
    /// Comma-separated ids.
    ids: Option<String>,
    /// Comma-separated statuses.
    status: Option<String>,
    kind: Option<String>,
    contact: Option<String>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

fn split_csv(value: Option<&str>) -> Vec<&str> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

impl InvoicesQuery {
    fn into_filter(self) -> Result<InvoiceFilter, HttpError> {
        let statuses = split_csv(self.status.as_deref())
            .into_iter()
            .map(|s| InvoiceStatus::parse(s).ok_or_else(|| HttpError::bad_request(format!("unknown invoice status `{s}`"))))
            .collect::<Result<Vec<_>, _>>()?;
        let kind = match self.kind.as_deref().map(str::to_ascii_uppercase).as_deref() {
            None | Some("") => None,
            Some("ACCREC") => Some(InvoiceKind::Receivable),
            Some("ACCPAY") => Some(InvoiceKind::Payable),
            Some(other) => return Err(HttpError::bad_request(format!("unknown invoice kind `{other}`"))),
        };
        Ok(InvoiceFilter {
            ids: split_csv(self.ids.as_deref()).into_iter().map(String::from).collect(),
            statuses,
            kind,
            contact: self.contact.filter(|c| !c.trim().is_empty()),
            from: self.from,
            to: self.to,
        })
    }
}

async fn list_invoices_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<InvoicesQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let invoices = state.service.list_invoices(&query.into_filter()?).await?;
    to_json(&invoices)
}

async fn bulk_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<BulkRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    to_json(&state.service.bulk(request).await?)
}

async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ClearingRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    to_json(&state.service.reconcile_clearing(request).await?)
}

fn default_dry_run() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PurgeQuery {
    #[serde(default = "default_dry_run")]
    dry_run: bool,
}

async fn purge_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    query: Result<Query<PurgeQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let outcome = state
        .service
        .purge(PurgeRequest {
            account: id,
            dry_run: query.dry_run,
        })
        .await?;
    to_json(&outcome)
}

#[derive(Debug, Deserialize)]
struct RestoreBody {
    payments: Vec<NewPayment>,
}

async fn restore_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RestoreBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    to_json(&state.service.restore_payments(&body.payments).await?)
}

async fn budget_sync_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    match state.service.budget_sync().await {
        Ok(summary) => to_json(&summary),
        Err(err) => {
            if !matches!(err, OpsError::NotConfigured(_)) {
                error!(error = %err, "budget sync failed");
            }
            Err(err.into())
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    month: Option<String>,
}

async fn budget_summary_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<SummaryQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let month = match query.month.as_deref() {
        Some(raw) => raw.parse::<BudgetMonth>().map_err(HttpError::bad_request)?,
        None => BudgetMonth::current(),
    };
    to_json(&state.service.budget_summary(month).await?)
}

async fn tools_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"tools": state.tools.function_specs()}))
}

async fn tool_call_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(args) = body?;
    Ok(Json(state.tools.dispatch(&name, args).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use finops_core::{Cents, Invoice};
    use finops_integrations::MemoryLedger;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const TOKEN: &str = "test-admin-token";

    fn invoice(id: &str, status: InvoiceStatus) -> Invoice {
        Invoice {
            id: id.to_string(),
            number: Some(format!("INV-{id}")),
            kind: InvoiceKind::Receivable,
            contact_name: Some("Riverside Podiatry".into()),
            status,
            date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
            total: Cents(15_000),
            amount_due: Cents(15_000),
            amount_paid: Cents::ZERO,
            payments: vec![],
            reference: None,
        }
    }

    fn test_app(root: &std::path::Path, admin_token: Option<&str>) -> (Router, Arc<MemoryLedger>) {
        let ledger = Arc::new(
            MemoryLedger::new()
                .with_invoice(invoice("a", InvoiceStatus::Authorised))
                .with_invoice(invoice("b", InvoiceStatus::Paid)),
        );
        let config = FinopsConfig {
            audit_dir: root.join("audit"),
            reports_dir: root.join("reports"),
            admin_token: admin_token.map(String::from),
            ..FinopsConfig::default()
        };
        let service = Arc::new(FinopsService::new(config, ledger.clone(), None));
        (app(AppState::new(service)), ledger)
    }

    fn get_req(uri: &str, token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path(), Some(TOKEN));
        let resp = app.oneshot(get_req("/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn api_requires_matching_bearer_token() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path(), Some(TOKEN));

        let missing = app.clone().oneshot(get_req("/api/xero/invoices", None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert!(body_json(missing).await["error"].is_string());

        let wrong = app.clone().oneshot(get_req("/api/xero/invoices", Some("nope"))).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = app
            .oneshot(get_req("/api/xero/invoices?status=PAID", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let rows = body_json(ok).await;
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["id"], "b");
    }

    #[tokio::test]
    async fn unconfigured_token_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path(), None);
        let resp = app.oneshot(get_req("/api/tools", Some(""))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bulk_defaults_to_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let (app, ledger) = test_app(dir.path(), Some(TOKEN));
        let resp = app
            .oneshot(post_json(
                "/api/xero/invoices/bulk",
                json!({"operation": "void", "invoice_ids": ["a"]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["dry_run"], true);
        assert_eq!(body["items"][0]["status"], "planned");
        assert!(ledger.calls().await.is_empty());
    }

    #[tokio::test]
    async fn bulk_apply_mutates_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let (app, ledger) = test_app(dir.path(), Some(TOKEN));
        let resp = app
            .oneshot(post_json(
                "/api/xero/invoices/bulk",
                json!({"operation": "void", "invoice_ids": ["a"], "dry_run": false}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["counts"]["succeeded"], 1);
        assert_eq!(ledger.invoice("a").await.unwrap().status, InvoiceStatus::Voided);
    }

    #[tokio::test]
    async fn malformed_body_is_a_json_400() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path(), Some(TOKEN));
        let resp = app
            .oneshot(post_json("/api/xero/invoices/bulk", json!({"operation": "shred"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn budget_routes_are_unavailable_without_a_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path(), Some(TOKEN));
        let resp = app
            .clone()
            .oneshot(post_json("/api/budget/sync", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bad_month = app
            .oneshot(get_req("/api/budget/summary?month=2026-13", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(bad_month.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn purge_of_unknown_account_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path(), Some(TOKEN));
        let resp = app
            .oneshot(post_json("/api/xero/accounts/nope/purge", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tools_are_listed_and_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path(), Some(TOKEN));
        let listed = app.clone().oneshot(get_req("/api/tools", Some(TOKEN))).await.unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        assert_eq!(body_json(listed).await["tools"].as_array().unwrap().len(), 5);

        let called = app
            .clone()
            .oneshot(post_json("/api/tools/list_invoices", json!({"statuses": ["AUTHORISED"]})))
            .await
            .unwrap();
        assert_eq!(called.status(), StatusCode::OK);
        assert_eq!(body_json(called).await[0]["id"], "a");

        let unknown = app
            .oneshot(post_json("/api/tools/void_everything", json!({})))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn ledger_failures_map_to_bad_gateway() {
        let err: HttpError = OpsError::Ledger(LedgerError::transport("inv-1", "connection reset")).into();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        let err: HttpError = OpsError::InvalidInput("x".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
