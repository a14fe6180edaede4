use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, Method, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use fellowship_shared::tokens::SubscriptionToken;
use fellowship_shared::{
    FeatureSet, GroupId, MessageId, MessageKind, Role, Tier, UserId,
};
use fellowship_store::{GroupChanges, Membership, MessageContent, NewGroup};

use crate::assistant::{Answer, Turn};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::gateway::{Gateway, GroupView, MessagePage, MessageView};
use crate::identity::IdentityVerifier;
use crate::subscriptions::SubscriptionVerifier;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub identity: Arc<IdentityVerifier>,
    pub subscriptions: Arc<SubscriptionVerifier>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

/// The signed-in user, if the request carried a valid session token.
pub struct Actor(pub Option<UserId>);

impl FromRequestParts<AppState> for Actor {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        Ok(Actor(state.identity.authenticate(header, Utc::now())))
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/me/entitlements", get(my_entitlements))
        .route("/subscriptions", post(record_subscription))
        .route("/assistant/ask", post(ask_assistant))
        .route("/billing/checkout", post(start_checkout))
        .route("/billing/portal", post(open_billing_portal))
        .route("/groups", get(list_my_groups).post(create_group))
        .route("/groups/discover", get(list_discoverable))
        .route(
            "/groups/{id}",
            get(get_group).patch(update_group).delete(delete_group),
        )
        .route("/groups/{id}/invite-code", post(regenerate_invite_code))
        .route("/groups/{id}/join", post(join_group))
        .route("/groups/{id}/leave", post(leave_group))
        .route("/groups/{id}/invitations", post(invite_member))
        .route("/groups/{id}/owner", put(transfer_ownership))
        .route("/groups/{id}/members", get(list_members))
        .route("/groups/{id}/members/{user}", axum::routing::delete(remove_member))
        .route("/groups/{id}/members/{user}/role", put(change_role))
        .route("/groups/{id}/messages", get(list_messages).post(post_message))
        .route(
            "/messages/{id}",
            get(get_message).patch(edit_message).delete(delete_message),
        )
        .route("/admin/status", get(admin_status))
        .route("/admin/grant", post(admin_grant))
        .route("/admin/revoke", post(admin_revoke))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request / response bodies ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    free_daily_ai_questions: u32,
    assistant_enabled: bool,
    billing_enabled: bool,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    uptime_secs: u64,
    cached_subscriptions: usize,
    database: Option<String>,
}

#[derive(Serialize)]
struct RedirectResponse {
    url: String,
}

#[derive(Deserialize)]
struct PageQuery {
    page_size: Option<u32>,
    before: Option<i64>,
}

#[derive(Deserialize, Default)]
struct JoinRequest {
    invite_code: Option<String>,
}

#[derive(Deserialize)]
struct UserRequest {
    user: UserId,
}

#[derive(Deserialize)]
struct RoleRequest {
    role: Role,
}

#[derive(Deserialize)]
struct PostRequest {
    kind: MessageKind,
    #[serde(flatten)]
    content: MessageContent,
    reply_to: Option<MessageId>,
}

#[derive(Deserialize)]
struct EditRequest {
    body: String,
}

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    #[serde(default)]
    prior_turns: Vec<Turn>,
}

#[derive(Deserialize)]
struct CheckoutRequest {
    tier: Tier,
}

#[derive(Deserialize)]
struct AdminGrantRequest {
    user: UserId,
    tier: Tier,
    #[serde(default = "default_grant_days")]
    days: i64,
}

fn default_grant_days() -> i64 {
    // Effectively permanent until revoked.
    36_500
}

// ─── Instance ───

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        free_daily_ai_questions: state.config.free_daily_ai_questions,
        assistant_enabled: state.config.assistant_url.is_some(),
        billing_enabled: state.config.billing_url.is_some(),
    })
}

// ─── Entitlements, assistant, billing ───

async fn my_entitlements(
    State(state): State<AppState>,
    Actor(actor): Actor,
) -> Result<Json<FeatureSet>, ServerError> {
    Ok(Json(state.gateway.entitlements(actor).await?))
}

/// Accept a subscription snapshot signed by the payment server. Anyone may
/// deliver it; the signature is what counts.
async fn record_subscription(
    State(state): State<AppState>,
    Json(token): Json<SubscriptionToken>,
) -> Result<Json<FeatureSet>, ServerError> {
    Ok(Json(state.subscriptions.record(&token).await?))
}

async fn ask_assistant(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(req): Json<AskRequest>,
) -> Result<Json<Answer>, ServerError> {
    let answer = state
        .gateway
        .ask_assistant(actor, req.question, req.prior_turns)
        .await?;
    Ok(Json(answer))
}

async fn start_checkout(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<RedirectResponse>, ServerError> {
    let url = state.gateway.start_checkout(actor, req.tier).await?;
    Ok(Json(RedirectResponse { url }))
}

async fn open_billing_portal(
    State(state): State<AppState>,
    Actor(actor): Actor,
) -> Result<Json<RedirectResponse>, ServerError> {
    let url = state.gateway.open_billing_portal(actor).await?;
    Ok(Json(RedirectResponse { url }))
}

// ─── Groups ───

async fn list_my_groups(
    State(state): State<AppState>,
    Actor(actor): Actor,
) -> Result<Json<Vec<GroupView>>, ServerError> {
    Ok(Json(state.gateway.list_my_groups(actor).await?))
}

async fn list_discoverable(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<GroupView>>, ServerError> {
    Ok(Json(
        state.gateway.list_discoverable(actor, page.page_size).await?,
    ))
}

async fn create_group(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(group): Json<NewGroup>,
) -> Result<(StatusCode, Json<GroupView>), ServerError> {
    let view = state.gateway.create_group(actor, group).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_group(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
) -> Result<Json<GroupView>, ServerError> {
    Ok(Json(state.gateway.get_group(actor, id).await?))
}

async fn update_group(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
    Json(changes): Json<GroupChanges>,
) -> Result<Json<GroupView>, ServerError> {
    Ok(Json(state.gateway.update_group(actor, id, changes).await?))
}

async fn delete_group(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
) -> Result<StatusCode, ServerError> {
    state.gateway.delete_group(actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn regenerate_invite_code(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let code = state.gateway.regenerate_invite_code(actor, id).await?;
    Ok(Json(serde_json::json!({ "invite_code": code })))
}

// ─── Memberships ───

async fn join_group(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
    body: Option<Json<JoinRequest>>,
) -> Result<Json<Membership>, ServerError> {
    let Json(req) = body.unwrap_or_default();
    Ok(Json(state.gateway.join(actor, id, req.invite_code).await?))
}

async fn leave_group(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
) -> Result<StatusCode, ServerError> {
    state.gateway.leave(actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn invite_member(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
    Json(req): Json<UserRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let created = state.gateway.invite(actor, id, req.user).await?;
    Ok(Json(serde_json::json!({ "invited": true, "new": created })))
}

async fn transfer_ownership(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
    Json(req): Json<UserRequest>,
) -> Result<StatusCode, ServerError> {
    state.gateway.transfer_ownership(actor, id, req.user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_members(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
) -> Result<Json<Vec<Membership>>, ServerError> {
    Ok(Json(state.gateway.members(actor, id).await?))
}

async fn remove_member(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path((id, user)): Path<(GroupId, UserId)>,
) -> Result<StatusCode, ServerError> {
    state.gateway.remove_member(actor, id, user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn change_role(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path((id, user)): Path<(GroupId, UserId)>,
    Json(req): Json<RoleRequest>,
) -> Result<Json<Membership>, ServerError> {
    Ok(Json(
        state.gateway.change_role(actor, id, user, req.role).await?,
    ))
}

// ─── Messages ───

async fn list_messages(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
    Query(page): Query<PageQuery>,
) -> Result<Json<MessagePage>, ServerError> {
    let page = state
        .gateway
        .list_messages(actor, id, page.page_size, page.before)
        .await?;
    Ok(Json(page))
}

async fn post_message(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<GroupId>,
    Json(req): Json<PostRequest>,
) -> Result<(StatusCode, Json<MessageView>), ServerError> {
    let view = state
        .gateway
        .post(actor, id, req.kind, req.content, req.reply_to)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_message(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<MessageId>,
) -> Result<Json<MessageView>, ServerError> {
    Ok(Json(state.gateway.get_message(actor, id).await?))
}

async fn edit_message(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<MessageId>,
    Json(req): Json<EditRequest>,
) -> Result<Json<MessageView>, ServerError> {
    Ok(Json(state.gateway.edit(actor, id, req.body).await?))
}

async fn delete_message(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<MessageId>,
) -> Result<StatusCode, ServerError> {
    state.gateway.soft_delete(actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Admin ───

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // Constant-time comparison to prevent timing attacks on admin token.
    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        cached_subscriptions: state.subscriptions.cached().await,
        database: state
            .gateway
            .database()
            .path()
            .map(|p| p.display().to_string()),
    }))
}

async fn admin_grant(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminGrantRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    if req.days <= 0 {
        return Err(ServerError::BadRequest("days must be positive".into()));
    }

    state
        .subscriptions
        .admin_grant(req.user, req.tier, req.days)
        .await?;

    info!(user = %req.user, tier = %req.tier, days = req.days, "Admin granted subscription");
    Ok(Json(serde_json::json!({ "granted": true })))
}

async fn admin_revoke(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UserRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    state.subscriptions.admin_revoke(req.user).await?;

    info!(user = %req.user, "Admin revoked subscription");
    Ok(Json(serde_json::json!({ "revoked": true })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use fellowship_shared::tokens::SessionToken;
    use fellowship_shared::{Subscription, SubscriptionStatus};
    use fellowship_store::Database;
    use rand::rngs::OsRng;
    use tower::ServiceExt;

    use crate::assistant::DisabledAssistant;
    use crate::billing::DisabledBilling;
    use crate::gateway::Policy;

    struct Harness {
        router: Router,
        identity_key: SigningKey,
        payment_key: SigningKey,
    }

    impl Harness {
        fn new() -> Self {
            let identity_key = SigningKey::generate(&mut OsRng);
            let payment_key = SigningKey::generate(&mut OsRng);
            let db = Arc::new(Database::open_in_memory().unwrap());

            let config = ServerConfig {
                admin_token: Some("let-me-in".into()),
                ..ServerConfig::default()
            };
            let gateway = Gateway::new(
                db.clone(),
                Arc::new(DisabledAssistant),
                Arc::new(DisabledBilling),
                Policy {
                    free_daily_ai_questions: config.free_daily_ai_questions,
                },
            );
            let state = AppState {
                gateway,
                identity: Arc::new(IdentityVerifier::new(identity_key.verifying_key().to_bytes())),
                subscriptions: Arc::new(SubscriptionVerifier::new(
                    payment_key.verifying_key().to_bytes(),
                    db,
                )),
                config: Arc::new(config),
                started_at: Instant::now(),
            };

            Self {
                router: build_router(state),
                identity_key,
                payment_key,
            }
        }

        fn bearer(&self, user: UserId) -> String {
            let token = SessionToken::create(user, Utc::now() + Duration::hours(1), &self.identity_key);
            format!("Bearer {}", token.encode())
        }

        async fn call(
            &self,
            method: &str,
            uri: &str,
            auth: Option<String>,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, serde_json::Value) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(auth) = auth {
                req = req.header("authorization", auth);
            }
            let req = match body {
                Some(json) => req
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string())),
                None => req.body(Body::empty()),
            }
            .unwrap();

            let resp = self.router.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            (status, json)
        }
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = Harness::new();
        let (status, body) = h.call("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_token_is_401_with_kind() {
        let h = Harness::new();
        let (status, body) = h.call("GET", "/groups", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["kind"], "unauthenticated");
    }

    #[tokio::test]
    async fn group_lifecycle_over_http() {
        let h = Harness::new();
        let owner = UserId::new();

        let (status, created) = h
            .call(
                "POST",
                "/groups",
                Some(h.bearer(owner)),
                Some(serde_json::json!({ "name": "Choir", "visibility": "public" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["member_count"], 1);
        assert_eq!(created["role"], "owner");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, posted) = h
            .call(
                "POST",
                &format!("/groups/{id}/messages"),
                Some(h.bearer(owner)),
                Some(serde_json::json!({ "kind": "text", "body": "Rehearsal at 7" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(posted["reply_unavailable"], false);

        let (status, page) = h
            .call("GET", &format!("/groups/{id}/messages"), Some(h.bearer(owner)), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["messages"].as_array().unwrap().len(), 1);

        let (status, body) = h
            .call("POST", &format!("/groups/{id}/leave"), Some(h.bearer(owner)), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "conflict");

        let (status, _) = h
            .call("GET", &format!("/groups/{}", GroupId::new()), Some(h.bearer(owner)), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn media_paywall_is_402_until_subscription_arrives() {
        let h = Harness::new();
        let user = UserId::new();

        let (_, created) = h
            .call(
                "POST",
                "/groups",
                Some(h.bearer(user)),
                Some(serde_json::json!({ "name": "Photos", "visibility": "public" })),
            )
            .await;
        let id = created["id"].as_str().unwrap().to_string();
        let media = serde_json::json!({ "kind": "media", "media_url": "https://cdn.example/a.jpg" });

        let (status, body) = h
            .call(
                "POST",
                &format!("/groups/{id}/messages"),
                Some(h.bearer(user)),
                Some(media.clone()),
            )
            .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"]["feature"], "media_messages");

        let now = Utc::now();
        let token = SubscriptionToken::create(
            Subscription {
                user,
                tier: Tier::Premium,
                status: SubscriptionStatus::Active,
                period_start: now - Duration::days(1),
                period_end: now + Duration::days(30),
            },
            now,
            &h.payment_key,
        );
        let (status, features) = h
            .call("POST", "/subscriptions", None, Some(serde_json::to_value(&token).unwrap()))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(features["tier"], "premium");

        let (status, _) = h
            .call("POST", &format!("/groups/{id}/messages"), Some(h.bearer(user)), Some(media))
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn unconfigured_billing_is_503() {
        let h = Harness::new();
        let (status, body) = h
            .call(
                "POST",
                "/billing/checkout",
                Some(h.bearer(UserId::new())),
                Some(serde_json::json!({ "tier": "premium" })),
            )
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["kind"], "unavailable");
    }

    #[tokio::test]
    async fn admin_requires_token() {
        let h = Harness::new();
        let (status, _) = h.call("GET", "/admin/status", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = h
            .call("GET", "/admin/status", Some("Bearer wrong-token".into()), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = h
            .call("GET", "/admin/status", Some("Bearer let-me-in".into()), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Fellowship");
    }

    #[tokio::test]
    async fn admin_grant_rejects_huge_duration() {
        let h = Harness::new();
        let user = UserId::new();
        let grant = |days: i64| serde_json::json!({ "user": user, "tier": "premium", "days": days });

        let (status, body) = h
            .call("POST", "/admin/grant", Some("Bearer let-me-in".into()), Some(grant(1_000_000_000)))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_argument");

        let (status, _) = h
            .call("POST", "/admin/grant", Some("Bearer let-me-in".into()), Some(grant(30)))
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = h.call("GET", "/me/entitlements", Some(h.bearer(user)), None).await;
        assert_eq!(body["tier"], "premium");
    }
}
