use std::collections::HashMap;

use anyhow::Context;
use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use tracing::instrument;

use super::{
    dto::{
        ChangePasswordRequest, LoginRequest, LoginResponse, RefreshRequest, RegisterInput,
        TokenResponse, UpdateAccountRequest,
    },
    extractors::{cookie_value, AuthUser, ACCESS_COOKIE, REFRESH_COOKIE},
    jwt::TokenPair,
    repo_types::{MediaSlot, PublicUser},
    services,
};
use crate::{
    error::AppResult,
    media::UploadItem,
    response::ApiResponse,
    state::AppState,
};

const UPLOAD_LIMIT: usize = 10 * 1024 * 1024;

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/users/login", post(login))
        .route("/users/logout", post(logout))
        .route("/users/refresh-token", post(refresh_token))
        .route("/users/change-password", post(change_password))
        .route("/users/current-user", get(current_user))
        .route("/users/update-account", patch(update_account))
}

pub fn upload_routes() -> Router<AppState> {
    Router::new()
        .route("/users/register", post(register))
        .route("/users/avatar", patch(update_avatar))
        .route("/users/cover-image", patch(update_cover_image))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT))
}

// --- cookies ---

fn cookie(name: &str, value: &str, secure: bool, clear: bool) -> anyhow::Result<HeaderValue> {
    let mut raw = format!("{name}={value}; HttpOnly; Path=/; SameSite=Lax");
    if secure {
        raw.push_str("; Secure");
    }
    if clear {
        raw.push_str("; Max-Age=0");
    }
    HeaderValue::from_str(&raw).with_context(|| format!("build {name} cookie"))
}

fn session_cookies(pair: &TokenPair, secure: bool) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.append(
        header::SET_COOKIE,
        cookie(ACCESS_COOKIE, &pair.access_token, secure, false)?,
    );
    headers.append(
        header::SET_COOKIE,
        cookie(REFRESH_COOKIE, &pair.refresh_token, secure, false)?,
    );
    Ok(headers)
}

fn cleared_cookies(secure: bool) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.append(header::SET_COOKIE, cookie(ACCESS_COOKIE, "", secure, true)?);
    headers.append(header::SET_COOKIE, cookie(REFRESH_COOKIE, "", secure, true)?);
    Ok(headers)
}

// --- multipart ---

#[derive(Default)]
struct Form {
    text: HashMap<String, String>,
    files: HashMap<String, UploadItem>,
}

async fn read_form(mut mp: Multipart) -> AppResult<Form> {
    let mut form = Form::default();
    while let Some(field) = mp.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if field.file_name().is_some() {
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let body = field.bytes().await?;
            form.files.insert(name, UploadItem { body, content_type });
        } else {
            form.text.insert(name, field.text().await?);
        }
    }
    Ok(form)
}

// --- handlers ---

/// POST /users/register (multipart: fullName, email, username, password, avatar, coverImage?)
#[instrument(skip(state, mp))]
pub async fn register(
    State(state): State<AppState>,
    mp: Result<Multipart, MultipartRejection>,
) -> AppResult<ApiResponse<PublicUser>> {
    let mut form = read_form(mp?).await?;
    let input = RegisterInput {
        full_name: form.text.remove("fullName"),
        email: form.text.remove("email"),
        username: form.text.remove("username"),
        password: form.text.remove("password"),
        avatar: form.files.remove("avatar"),
        cover_image: form.files.remove("coverImage"),
    };
    let user = services::register(&state, input).await?;
    Ok(ApiResponse::with_status(
        StatusCode::CREATED,
        user,
        "User registered successfully",
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AppResult<(HeaderMap, ApiResponse<LoginResponse>)> {
    let Json(req) = payload?;
    let (user, pair) = services::login(&state, req).await?;
    let cookies = session_cookies(&pair, state.config.cookie_secure)?;
    Ok((
        cookies,
        ApiResponse::ok(
            LoginResponse {
                user,
                access_token: pair.access_token,
                refresh_token: pair.refresh_token,
            },
            "User logged in successfully",
        ),
    ))
}

#[instrument(skip(state))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<(HeaderMap, ApiResponse<()>)> {
    services::logout(&state, user_id).await?;
    let cookies = cleared_cookies(state.config.cookie_secure)?;
    Ok((cookies, ApiResponse::ok((), "User logged out successfully")))
}

/// POST /users/refresh-token; token from the cookie, else from the body.
#[instrument(skip(state, headers, body))]
pub async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> AppResult<(HeaderMap, ApiResponse<TokenResponse>)> {
    let presented = cookie_value(&headers, REFRESH_COOKIE)
        .or_else(|| body.and_then(|Json(b)| b.refresh_token));
    let pair = services::refresh_session(&state, presented).await?;
    let cookies = session_cookies(&pair, state.config.cookie_secure)?;
    Ok((
        cookies,
        ApiResponse::ok(
            TokenResponse {
                access_token: pair.access_token,
                refresh_token: pair.refresh_token,
            },
            "Access token refreshed",
        ),
    ))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> AppResult<ApiResponse<()>> {
    let Json(req) = payload?;
    services::change_password(&state, user_id, req).await?;
    Ok(ApiResponse::ok((), "Password changed successfully"))
}

#[instrument(skip(state))]
pub async fn current_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<ApiResponse<PublicUser>> {
    let user = services::current_user(&state, user_id).await?;
    Ok(ApiResponse::ok(user, "Current user fetched successfully"))
}

#[instrument(skip(state, payload))]
pub async fn update_account(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<UpdateAccountRequest>, JsonRejection>,
) -> AppResult<ApiResponse<PublicUser>> {
    let Json(req) = payload?;
    let user = services::update_profile(&state, user_id, req).await?;
    Ok(ApiResponse::ok(user, "Account details updated successfully"))
}

#[instrument(skip(state, mp))]
pub async fn update_avatar(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mp: Result<Multipart, MultipartRejection>,
) -> AppResult<ApiResponse<PublicUser>> {
    let mut form = read_form(mp?).await?;
    let file = form.files.remove("avatar");
    let user = services::update_media(&state, user_id, MediaSlot::Avatar, file).await?;
    Ok(ApiResponse::ok(user, "Avatar updated successfully"))
}

#[instrument(skip(state, mp))]
pub async fn update_cover_image(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mp: Result<Multipart, MultipartRejection>,
) -> AppResult<ApiResponse<PublicUser>> {
    let mut form = read_form(mp?).await?;
    let file = form.files.remove("coverImage");
    let user = services::update_media(&state, user_id, MediaSlot::CoverImage, file).await?;
    Ok(ApiResponse::ok(user, "Cover image updated successfully"))
}
