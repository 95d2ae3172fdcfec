use anyhow::Context;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use super::dto::{ChangePasswordRequest, LoginRequest, RegisterInput, UpdateAccountRequest};
use super::jwt::{TokenError, TokenPair};
use super::password::{PasswordHash, PasswordHasher};
use super::repo::StoreError;
use super::repo_types::{normalize_identity, MediaSlot, NewUser, PublicUser, User};
use crate::error::{AppError, AppResult};
use crate::media::{self, MediaError, MediaKind, UploadItem};
use crate::state::AppState;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn hash_blocking(hasher: PasswordHasher, plain: String) -> anyhow::Result<PasswordHash> {
    tokio::task::spawn_blocking(move || hasher.hash(&plain))
        .await
        .context("password hash task")?
}

async fn verify_blocking(
    hasher: PasswordHasher,
    plain: String,
    hash: PasswordHash,
) -> anyhow::Result<bool> {
    tokio::task::spawn_blocking(move || hasher.verify(&plain, &hash))
        .await
        .context("password verify task")?
}

fn signing_failed(e: TokenError) -> AppError {
    AppError::Internal(anyhow::Error::new(e).context("Failed to generate access and refresh token"))
}

pub async fn register(st: &AppState, input: RegisterInput) -> AppResult<PublicUser> {
    let fields = [
        ("fullName", present(input.full_name)),
        ("email", present(input.email)),
        ("username", present(input.username)),
        ("password", present(input.password)),
    ];
    let blank: Vec<String> = fields
        .iter()
        .filter(|(_, v)| v.is_none())
        .map(|(name, _)| name.to_string())
        .collect();
    let [(_, Some(full_name)), (_, Some(email)), (_, Some(username)), (_, Some(password))] = fields
    else {
        warn!(?blank, "registration with blank fields");
        return Err(AppError::validation_fields("All fields are required", blank));
    };

    let email = normalize_identity(&email);
    let username = normalize_identity(&username);
    if !is_valid_email(&email) {
        warn!(%email, "invalid email");
        return Err(AppError::validation_fields("Invalid email", vec!["email".into()]));
    }

    if st
        .users
        .find_by_login(Some(&username), Some(&email))
        .await?
        .is_some()
    {
        warn!(%username, %email, "username or email already registered");
        return Err(AppError::Conflict(
            "User with email or username already exists".into(),
        ));
    }

    let id = Uuid::new_v4();
    let avatar_url = media::upload(st.storage.as_ref(), id, MediaKind::Avatar, input.avatar)
        .await
        .map_err(|e| media_rejection(e, MediaSlot::Avatar))?;
    let cover_image_url = match media::upload(
        st.storage.as_ref(),
        id,
        MediaKind::CoverImage,
        input.cover_image,
    )
    .await
    {
        Ok(url) => Some(url),
        Err(MediaError::Missing) => None,
        Err(e) => {
            warn!(error = %e, "cover image upload failed; registering without it");
            None
        }
    };

    let uploaded: Vec<String> = std::iter::once(avatar_url.clone())
        .chain(cover_image_url.clone())
        .collect();
    let release_uploads = || uploaded.iter().for_each(|url| st.janitor.release(url));

    let password_hash = match hash_blocking(st.hasher, password).await {
        Ok(h) => h,
        Err(e) => {
            release_uploads();
            return Err(e.into());
        }
    };

    let new = NewUser {
        id,
        username,
        email,
        full_name: full_name.trim().to_string(),
        avatar_url,
        cover_image_url,
        password_hash,
    };
    let user = match st.users.create(new).await {
        Ok(u) => u,
        Err(StoreError::Duplicate) => {
            release_uploads();
            warn!("username or email taken concurrently");
            return Err(AppError::Conflict(
                "User with email or username already exists".into(),
            ));
        }
        Err(StoreError::Other(e)) => {
            release_uploads();
            return Err(e.context("Something went wrong while registering the user").into());
        }
    };

    info!(user_id = %user.id, username = %user.username, "user registered");
    Ok(PublicUser::from(&user))
}

pub async fn login(st: &AppState, req: LoginRequest) -> AppResult<(PublicUser, TokenPair)> {
    let username = present(req.username).map(|u| normalize_identity(&u));
    let email = present(req.email).map(|e| normalize_identity(&e));
    if username.is_none() && email.is_none() {
        warn!("login without username or email");
        return Err(AppError::validation_fields(
            "username or email is required",
            vec!["username".into(), "email".into()],
        ));
    }

    let user = st
        .users
        .find_by_login(username.as_deref(), email.as_deref())
        .await?
        .ok_or_else(|| {
            warn!(?username, ?email, "login for unknown user");
            AppError::NotFound("User does not exist".into())
        })?;

    if !verify_blocking(st.hasher, req.password, user.password_hash.clone()).await? {
        warn!(user_id = %user.id, "login with invalid password");
        return Err(AppError::auth("Invalid user credentials"));
    }

    let pair = st.keys.issue_pair(&user).map_err(signing_failed)?;
    st.users
        .set_refresh_token(user.id, Some(&pair.refresh_token))
        .await?;

    info!(user_id = %user.id, username = %user.username, "user logged in");
    Ok((PublicUser::from(&user), pair))
}

pub async fn logout(st: &AppState, user_id: Uuid) -> AppResult<()> {
    let existed = st.users.set_refresh_token(user_id, None).await?;
    info!(user_id = %user_id, existed, "user logged out");
    Ok(())
}

pub async fn refresh_session(st: &AppState, presented: Option<String>) -> AppResult<TokenPair> {
    let presented = present(presented).ok_or_else(|| AppError::auth("Unauthorized request"))?;

    let claims = st.keys.verify_refresh(&presented).map_err(|e| {
        match e {
            TokenError::Expired => warn!("refresh with expired token"),
            other => warn!(reason = %other, "refresh with invalid token"),
        }
        AppError::auth("Invalid refresh token")
    })?;

    let user = st.users.find_by_id(claims.sub).await?.ok_or_else(|| {
        warn!(user_id = %claims.sub, "refresh token for unknown user");
        AppError::auth("Invalid refresh token")
    })?;

    if user.refresh_token.as_deref() != Some(presented.as_str()) {
        warn!(user_id = %user.id, "refresh token does not match stored token; possible reuse");
        return Err(AppError::auth("Refresh token is expired or used"));
    }

    let pair = st.keys.issue_pair(&user).map_err(signing_failed)?;
    if !st
        .users
        .rotate_refresh_token(user.id, &presented, &pair.refresh_token)
        .await?
    {
        warn!(user_id = %user.id, "refresh token rotated concurrently; possible reuse");
        return Err(AppError::auth("Refresh token is expired or used"));
    }

    info!(user_id = %user.id, "session refreshed");
    Ok(pair)
}

pub async fn change_password(
    st: &AppState,
    user_id: Uuid,
    req: ChangePasswordRequest,
) -> AppResult<()> {
    if req.new_password.trim().is_empty() {
        return Err(AppError::validation_fields(
            "New password is required",
            vec!["newPassword".into()],
        ));
    }
    if req.new_password != req.confirm_password {
        warn!(user_id = %user_id, "password confirmation mismatch");
        return Err(AppError::validation_fields(
            "New password and confirm password do not match",
            vec!["confirmPassword".into()],
        ));
    }

    let user = load(st, user_id).await?;
    if !verify_blocking(st.hasher, req.old_password, user.password_hash.clone()).await? {
        warn!(user_id = %user_id, "change password with invalid old password");
        return Err(AppError::auth("Invalid old password"));
    }

    let hash = hash_blocking(st.hasher, req.new_password).await?;
    if !st.users.set_password_hash(user_id, &hash).await? {
        return Err(AppError::NotFound("User not found".into()));
    }
    info!(user_id = %user_id, "password changed");
    Ok(())
}

pub async fn current_user(st: &AppState, user_id: Uuid) -> AppResult<PublicUser> {
    load(st, user_id).await.map(|u| PublicUser::from(&u))
}

pub async fn update_profile(
    st: &AppState,
    user_id: Uuid,
    req: UpdateAccountRequest,
) -> AppResult<PublicUser> {
    let (Some(full_name), Some(email)) = (present(req.full_name), present(req.email)) else {
        return Err(AppError::validation_fields(
            "All fields are required",
            vec!["fullName".into(), "email".into()],
        ));
    };
    let email = normalize_identity(&email);
    if !is_valid_email(&email) {
        return Err(AppError::validation_fields("Invalid email", vec!["email".into()]));
    }

    let user = match st.users.update_profile(user_id, full_name.trim(), &email).await {
        Ok(Some(u)) => u,
        Ok(None) => return Err(AppError::NotFound("User not found".into())),
        Err(StoreError::Duplicate) => {
            warn!(user_id = %user_id, %email, "email already in use");
            return Err(AppError::Conflict("Email already in use".into()));
        }
        Err(StoreError::Other(e)) => return Err(e.into()),
    };
    info!(user_id = %user_id, "account details updated");
    Ok(PublicUser::from(&user))
}

/// Replaces the avatar or cover image; the old object is released in the background.
pub async fn update_media(
    st: &AppState,
    user_id: Uuid,
    slot: MediaSlot,
    item: Option<UploadItem>,
) -> AppResult<PublicUser> {
    let previous = load(st, user_id).await?;
    let kind = match slot {
        MediaSlot::Avatar => MediaKind::Avatar,
        MediaSlot::CoverImage => MediaKind::CoverImage,
    };
    let url = media::upload(st.storage.as_ref(), user_id, kind, item)
        .await
        .map_err(|e| media_rejection(e, slot))?;

    let user = match st.users.set_media(user_id, slot, &url).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            st.janitor.release(&url);
            return Err(AppError::NotFound("User not found".into()));
        }
        Err(e) => {
            st.janitor.release(&url);
            return Err(e.context("Something went wrong while saving the media").into());
        }
    };

    let old = match slot {
        MediaSlot::Avatar => Some(previous.avatar_url),
        MediaSlot::CoverImage => previous.cover_image_url,
    };
    if let Some(old) = old.filter(|o| *o != url) {
        st.janitor.release(&old);
    }

    info!(user_id = %user_id, slot = ?slot, "media updated");
    Ok(PublicUser::from(&user))
}

async fn load(st: &AppState, user_id: Uuid) -> AppResult<User> {
    st.users
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))
}

/// Missing files and failed uploads both reject the dependent field.
fn media_rejection(e: MediaError, slot: MediaSlot) -> AppError {
    let (label, field) = match slot {
        MediaSlot::Avatar => ("Avatar", "avatar"),
        MediaSlot::CoverImage => ("Cover image", "coverImage"),
    };
    let message = match e {
        MediaError::Missing => format!("{label} file is required"),
        MediaError::Upload(_) => format!("Error while uploading {}", label.to_lowercase()),
    };
    AppError::validation_fields(message, vec![field.into()])
}
