use actix_web::http::header::CONTENT_TYPE;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::bearer_token;
use crate::error::{AppError, AppResult};
use crate::media::check_image_upload;
use crate::models::user::{
    Credentials, Principal, ProfilePatch, ProfileView, RefreshRequest, Registration, TokenPair,
    User,
};
use crate::state::AppState;

#[derive(Serialize)]
struct SessionResponse {
    message: &'static str,
    #[serde(flatten)]
    tokens: TokenPair,
    user: ProfileView,
}

#[derive(Serialize)]
struct PictureResponse {
    message: &'static str,
    profile_picture_url: Option<String>,
}

fn profile_view(state: &AppState, user: User) -> ProfileView {
    ProfileView {
        full_name: user.full_name(),
        id: user.id,
        username: user.username,
        email: user.email,
        first_name: user.first_name,
        last_name: user.last_name,
        birthday: user.birthday,
        profile_picture: user
            .profile_picture
            .map(|file_ref| state.media.url_of(&file_ref)),
    }
}

// POST /accounts/register
pub async fn register(
    state: web::Data<AppState>,
    body: web::Json<Registration>,
) -> AppResult<HttpResponse> {
    let registration = body.into_inner().validate().map_err(|errors| {
        warn!("[API] Registration validation failed: {}", errors);
        AppError::Validation(errors)
    })?;
    let (user, tokens) = state.identity.register(registration).await?;
    Ok(HttpResponse::Created().json(SessionResponse {
        message: "User registered successfully.",
        tokens,
        user: profile_view(&state, user),
    }))
}

// POST /accounts/token
pub async fn login(
    state: web::Data<AppState>,
    body: web::Json<Credentials>,
) -> AppResult<HttpResponse> {
    let (user, tokens) = state.identity.authenticate(&body).await?;
    Ok(HttpResponse::Ok().json(SessionResponse {
        message: "Logged in successfully.",
        tokens,
        user: profile_view(&state, user),
    }))
}

// POST /accounts/token/refresh
pub async fn refresh(
    state: web::Data<AppState>,
    body: web::Json<RefreshRequest>,
) -> AppResult<HttpResponse> {
    let tokens = state.identity.refresh(body.refresh.trim()).await?;
    Ok(HttpResponse::Ok().json(tokens))
}

// POST /accounts/logout
pub async fn logout(
    state: web::Data<AppState>,
    req: HttpRequest,
    principal: Principal,
) -> AppResult<HttpResponse> {
    if let Some(token) = bearer_token(&req) {
        state.identity.revoke(&token).await?;
    }
    info!("[API] User {} logged out", principal.username);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "Logged out successfully" })))
}

// GET /accounts/profile
pub async fn profile(state: web::Data<AppState>, principal: Principal) -> AppResult<HttpResponse> {
    let user = state.identity.user(&principal.id).await?;
    Ok(HttpResponse::Ok().json(profile_view(&state, user)))
}

// PATCH /accounts/profile
pub async fn update_profile(
    state: web::Data<AppState>,
    principal: Principal,
    body: web::Json<ProfilePatch>,
) -> AppResult<HttpResponse> {
    let patch = body.into_inner().validate()?;
    let user = state.identity.update_profile(&principal.id, patch).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Profile updated successfully.",
        "user": profile_view(&state, user),
    })))
}

// PUT /accounts/profile/picture, raw image body
pub async fn upload_profile_picture(
    state: web::Data<AppState>,
    principal: Principal,
    req: HttpRequest,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let content_type = check_image_upload(content_type, body.len(), state.config.max_upload_bytes)?;

    let file_ref = state.media.store(&body, content_type).await?;
    let previous = match state
        .identity
        .set_profile_picture(&principal.id, Some(file_ref.clone()))
        .await
    {
        Ok(previous) => previous,
        Err(e) => {
            // the account row did not take the new file, so drop it
            if let Err(cleanup) = state.media.delete(&file_ref).await {
                warn!("[API] Could not remove orphaned {}: {}", file_ref, cleanup);
            }
            return Err(e);
        }
    };
    if let Some(old) = previous {
        if let Err(e) = state.media.delete(&old).await {
            warn!("[API] Could not remove old picture {}: {}", old, e);
        }
    }

    info!("[API] Profile picture updated for {}", principal.username);
    Ok(HttpResponse::Ok().json(PictureResponse {
        message: "Profile picture updated successfully.",
        profile_picture_url: Some(state.media.url_of(&file_ref)),
    }))
}

// DELETE /accounts/profile/picture
pub async fn remove_profile_picture(
    state: web::Data<AppState>,
    principal: Principal,
) -> AppResult<HttpResponse> {
    if let Some(old) = state.identity.set_profile_picture(&principal.id, None).await? {
        if let Err(e) = state.media.delete(&old).await {
            warn!("[API] Could not remove old picture {}: {}", old, e);
        }
    }
    info!("[API] Profile picture removed for {}", principal.username);
    Ok(HttpResponse::Ok().json(PictureResponse {
        message: "Profile picture removed successfully.",
        profile_picture_url: None,
    }))
}
