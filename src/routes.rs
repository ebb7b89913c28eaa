use actix_identity::Identity;
use actix_session::{storage::CookieSessionStore, SessionMiddleware};
use actix_web::{
    cookie::Key,
    delete, get,
    http::Method,
    post, put,
    web::{self, Data, Json, Path, Query},
    HttpMessage, HttpRequest, HttpResponse, Responder,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{
    analytics::{self, DashboardQuery, TimeWindow},
    auth::{self, AuthIdentity, LoginRequest, NewMemberRequest, RegisterRequest},
    errors::AppError,
    partition::{TenantId, TenantPartition},
    structs::{NewBiddingDocument, NewClient, NewProject},
    AppState,
};

const RECENT_PROJECTS_MAX: usize = 100;

/// Cookie-backed session. The session holds only the user id.
pub fn session_layer(key: Key, secure: bool) -> SessionMiddleware<CookieSessionStore> {
    SessionMiddleware::builder(CookieSessionStore::default(), key)
        .cookie_secure(secure)
        .build()
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| AppError::Validation(err.to_string()).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| AppError::Validation(err.to_string()).into()),
    )
    .service(health_handler)
    .service(register_handler)
    .service(login_handler)
    .service(logout_handler)
    .service(me_handler)
    .service(dashboard_handler)
    .service(list_projects_handler)
    .service(create_project_handler)
    .service(get_project_handler)
    .service(update_project_handler)
    .service(delete_project_handler)
    .service(list_project_documents_handler)
    .service(list_documents_handler)
    .service(create_document_handler)
    .service(get_document_handler)
    .service(update_document_handler)
    .service(delete_document_handler)
    .service(list_clients_handler)
    .service(create_client_handler)
    .service(get_client_handler)
    .service(update_client_handler)
    .service(delete_client_handler)
    .service(list_settings_handler)
    .service(get_setting_handler)
    .service(put_setting_handler)
    .service(delete_setting_handler)
    .service(add_user_handler)
    .service(deactivate_user_handler)
    .service(activate_user_handler);
}

pub async fn default_handler(req_method: Method) -> HttpResponse {
    match req_method {
        Method::GET => HttpResponse::NotFound().json(json!({ "error": "Not found" })),
        _ => HttpResponse::MethodNotAllowed().json(json!({ "error": "Method not allowed" })),
    }
}

async fn session_identity(
    state: &AppState,
    identity: Option<Identity>,
) -> Result<AuthIdentity, AppError> {
    let not_authenticated = || AppError::Unauthorized(auth::NOT_AUTHENTICATED.to_owned());
    let identity = identity.ok_or_else(not_authenticated)?;
    let user_id = identity
        .id()
        .map_err(|e| {
            log::warn!("Unreadable session identity: {}", e);
            not_authenticated()
        })?
        .parse::<i64>()
        .map_err(|_| not_authenticated())?;
    auth::current_identity(&state.db_pool, user_id).await
}

/// The caller's own partition. The tenant always comes from the session,
/// never from the request.
async fn session_partition(
    state: &AppState,
    identity: Option<Identity>,
) -> Result<TenantPartition, AppError> {
    let current = session_identity(state, identity).await?;
    state
        .partitions
        .scope(TenantId::from(&current.company))
        .await
}

fn remember(request: &HttpRequest, identity: &AuthIdentity) -> Result<(), AppError> {
    Identity::login(&request.extensions(), identity.user.id.to_string()).map_err(|e| {
        log::error!("Failed to attach identity to session: {}", e);
        AppError::Internal(e.to_string())
    })?;
    Ok(())
}

#[get("/health")]
pub async fn health_handler() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[post("/api/register")]
pub async fn register_handler(
    Json(form): Json<RegisterRequest>,
    state: Data<AppState>,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let meta = auth::partition_meta(&state.settings, &form.company_name);
    let identity = auth::register(&state.db_pool, &state.credentials, meta, form).await?;
    remember(&request, &identity)?;
    Ok(HttpResponse::Created().json(identity))
}

#[post("/api/login")]
pub async fn login_handler(
    Json(form): Json<LoginRequest>,
    state: Data<AppState>,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let identity = auth::login(&state.db_pool, &state.credentials, form).await?;
    remember(&request, &identity)?;
    Ok(HttpResponse::Ok().json(identity))
}

/// Clears the caller's session cookie. Nothing is revoked server-side.
#[post("/api/logout")]
pub async fn logout_handler(identity: Option<Identity>) -> impl Responder {
    if let Some(identity) = identity {
        identity.logout();
    }
    HttpResponse::Ok().json(auth::logout())
}

#[get("/api/me")]
pub async fn me_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let current = session_identity(&state, identity).await?;
    Ok(HttpResponse::Ok().json(current))
}

#[derive(Debug, Deserialize)]
pub struct DashboardParams {
    since: Option<DateTime<Utc>>,
    recent: Option<usize>,
}

#[get("/api/dashboard")]
pub async fn dashboard_handler(
    Query(params): Query<DashboardParams>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    let query = DashboardQuery {
        window: params
            .since
            .map_or(TimeWindow::AllTime, TimeWindow::Since),
        recent: params
            .recent
            .unwrap_or(state.settings.recent_projects_limit)
            .min(RECENT_PROJECTS_MAX),
    };
    let dashboard = analytics::dashboard(&partition, &query, Utc::now()).await?;
    Ok(HttpResponse::Ok().json(dashboard))
}

#[get("/api/projects")]
pub async fn list_projects_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.list_projects().await?))
}

#[post("/api/projects")]
pub async fn create_project_handler(
    Json(form): Json<NewProject>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Created().json(partition.insert_project(&form).await?))
}

#[get("/api/projects/{id}")]
pub async fn get_project_handler(
    id: Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.get_project(id.into_inner()).await?))
}

#[put("/api/projects/{id}")]
pub async fn update_project_handler(
    id: Path<i64>,
    Json(form): Json<NewProject>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.update_project(id.into_inner(), &form).await?))
}

#[delete("/api/projects/{id}")]
pub async fn delete_project_handler(
    id: Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    partition.delete_project(id.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[get("/api/projects/{id}/documents")]
pub async fn list_project_documents_handler(
    id: Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    let project = partition.get_project(id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(partition.list_project_documents(project.id).await?))
}

#[get("/api/documents")]
pub async fn list_documents_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.list_documents().await?))
}

#[post("/api/documents")]
pub async fn create_document_handler(
    Json(form): Json<NewBiddingDocument>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Created().json(partition.insert_document(&form).await?))
}

#[get("/api/documents/{id}")]
pub async fn get_document_handler(
    id: Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.get_document(id.into_inner()).await?))
}

#[put("/api/documents/{id}")]
pub async fn update_document_handler(
    id: Path<i64>,
    Json(form): Json<NewBiddingDocument>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.update_document(id.into_inner(), &form).await?))
}

#[delete("/api/documents/{id}")]
pub async fn delete_document_handler(
    id: Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    partition.delete_document(id.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[get("/api/clients")]
pub async fn list_clients_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.list_clients().await?))
}

#[post("/api/clients")]
pub async fn create_client_handler(
    Json(form): Json<NewClient>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Created().json(partition.insert_client(&form).await?))
}

#[get("/api/clients/{id}")]
pub async fn get_client_handler(
    id: Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.get_client(id.into_inner()).await?))
}

#[put("/api/clients/{id}")]
pub async fn update_client_handler(
    id: Path<i64>,
    Json(form): Json<NewClient>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.update_client(id.into_inner(), &form).await?))
}

#[delete("/api/clients/{id}")]
pub async fn delete_client_handler(
    id: Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    partition.delete_client(id.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
pub struct SettingValue {
    value: String,
}

#[get("/api/settings")]
pub async fn list_settings_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.list_settings().await?))
}

#[get("/api/settings/{key}")]
pub async fn get_setting_handler(
    key: Path<String>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.get_setting(&key).await?))
}

#[put("/api/settings/{key}")]
pub async fn put_setting_handler(
    key: Path<String>,
    Json(form): Json<SettingValue>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    Ok(HttpResponse::Ok().json(partition.put_setting(&key, &form.value).await?))
}

#[delete("/api/settings/{key}")]
pub async fn delete_setting_handler(
    key: Path<String>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let partition = session_partition(&state, identity).await?;
    partition.delete_setting(&key).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/api/users")]
pub async fn add_user_handler(
    Json(form): Json<NewMemberRequest>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let actor = session_identity(&state, identity).await?;
    let user = auth::add_member(&state.db_pool, &state.credentials, &actor, form).await?;
    Ok(HttpResponse::Created().json(user))
}

#[post("/api/users/{id}/deactivate")]
pub async fn deactivate_user_handler(
    id: Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let actor = session_identity(&state, identity).await?;
    let user = auth::set_user_active(&state.db_pool, &actor, id.into_inner(), false).await?;
    Ok(HttpResponse::Ok().json(user))
}

#[post("/api/users/{id}/activate")]
pub async fn activate_user_handler(
    id: Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
) -> Result<impl Responder, AppError> {
    let actor = session_identity(&state, identity).await?;
    let user = auth::set_user_active(&state.db_pool, &actor, id.into_inner(), true).await?;
    Ok(HttpResponse::Ok().json(user))
}
