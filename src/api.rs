use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

use crate::auth::MaybePrincipal;
use crate::db::{Page, ReviewFilter};
use crate::error::{AppError, AppResult, FieldErrors};
use crate::models::feedback::NewFeedback;
use crate::models::review::{NewReview, Rating, ReviewPatch, ReviewRecord, TargetSummary};
use crate::models::user::Principal;
use crate::state::AppState;

/// `?limit=&offset=` on list endpoints.
#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListQuery {
    fn page(&self, state: &AppState) -> Page {
        Page {
            limit: state.config.page_limit(self.limit),
            offset: self.offset.unwrap_or(0),
        }
    }
}

/// Public projection of a review.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReviewView {
    pub id: String,
    pub target_name: String,
    pub rating: Rating,
    pub stars_display: String,
    pub title: String,
    pub comment: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_verified: bool,
    pub helpful_count: u32,
    pub author_name: Option<String>,
    pub author_picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    /// Only present when the reader is authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voted_helpful: Option<bool>,
}

fn present(state: &AppState, record: ReviewRecord, voted_helpful: Option<bool>) -> ReviewView {
    let ReviewRecord {
        review,
        author_name,
        author_picture,
    } = record;
    ReviewView {
        author_id: state.config.expose_author_ids.then_some(review.author_id),
        id: review.id,
        target_name: review.target_name,
        rating: review.rating,
        stars_display: review.rating.stars(),
        title: review.title,
        comment: review.comment,
        created_at: review.created_at,
        updated_at: review.updated_at,
        is_verified: review.is_verified,
        helpful_count: review.helpful_count,
        author_name,
        author_picture: author_picture.map(|file_ref| state.media.url_of(&file_ref)),
        voted_helpful,
    }
}

async fn present_many(
    state: &AppState,
    records: Vec<ReviewRecord>,
    viewer: &MaybePrincipal,
) -> AppResult<Vec<ReviewView>> {
    let voted: Option<HashSet<String>> = match &viewer.0 {
        Some(principal) => {
            let ids: Vec<&str> = records.iter().map(|r| r.review.id.as_str()).collect();
            Some(state.db.voted_among(&principal.id, &ids).await?)
        }
        None => None,
    };
    Ok(records
        .into_iter()
        .map(|record| {
            let flag = voted.as_ref().map(|set| set.contains(&record.review.id));
            present(state, record, flag)
        })
        .collect())
}

// GET /reviews
pub async fn list_reviews(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
    viewer: MaybePrincipal,
) -> AppResult<HttpResponse> {
    let records = state
        .db
        .list_reviews(ReviewFilter::All, query.page(&state))
        .await?;
    Ok(HttpResponse::Ok().json(present_many(&state, records, &viewer).await?))
}

// POST /reviews
pub async fn create_review(
    state: web::Data<AppState>,
    principal: Principal,
    body: web::Json<NewReview>,
) -> AppResult<HttpResponse> {
    let review = body.into_inner().validate()?;
    info!(
        "[API] Review request from {} for '{}'",
        principal.username, review.target_name
    );
    let created = state.db.create_review(&principal.id, review).await?;
    let record = state.db.get_review_record(&created.id).await?;
    Ok(HttpResponse::Created().json(present(&state, record, Some(false))))
}

// GET /reviews/mine
pub async fn my_reviews(
    state: web::Data<AppState>,
    principal: Principal,
    query: web::Query<ListQuery>,
) -> AppResult<HttpResponse> {
    let records = state
        .db
        .list_reviews(ReviewFilter::Author(&principal.id), query.page(&state))
        .await?;
    let viewer = MaybePrincipal(Some(principal));
    Ok(HttpResponse::Ok().json(present_many(&state, records, &viewer).await?))
}

// GET /reviews/{id}
pub async fn get_review(
    state: web::Data<AppState>,
    path: web::Path<String>,
    viewer: MaybePrincipal,
) -> AppResult<HttpResponse> {
    let record = state.db.get_review_record(&path).await?;
    let mut views = present_many(&state, vec![record], &viewer).await?;
    let view = views.pop().ok_or(AppError::NotFound)?;
    Ok(HttpResponse::Ok().json(view))
}

// PATCH /reviews/{id}
pub async fn update_review(
    state: web::Data<AppState>,
    principal: Principal,
    path: web::Path<String>,
    body: web::Json<ReviewPatch>,
) -> AppResult<HttpResponse> {
    let patch = body.into_inner().validate()?;
    state.db.update_review(&path, &principal, patch).await?;
    let record = state.db.get_review_record(&path).await?;
    let voted = state.db.has_voted(&path, &principal.id).await?;
    Ok(HttpResponse::Ok().json(present(&state, record, Some(voted))))
}

// DELETE /reviews/{id}
pub async fn delete_review(
    state: web::Data<AppState>,
    principal: Principal,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    state.db.delete_review(&path, &principal).await?;
    Ok(HttpResponse::NoContent().finish())
}

// POST /reviews/{id}/helpful
pub async fn toggle_helpful(
    state: web::Data<AppState>,
    principal: Principal,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let outcome = state.db.toggle_helpful(&path, &principal.id).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

// GET /services/{name}/reviews
pub async fn service_reviews(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ListQuery>,
    viewer: MaybePrincipal,
) -> AppResult<HttpResponse> {
    let name = path.into_inner();
    let records = state
        .db
        .list_reviews(ReviewFilter::Target(name.trim()), query.page(&state))
        .await?;
    Ok(HttpResponse::Ok().json(present_many(&state, records, &viewer).await?))
}

// GET /services/{name}/summary
pub async fn service_summary(
    state: web::Data<AppState>,
    path: web::Path<String>,
    viewer: MaybePrincipal,
) -> AppResult<HttpResponse> {
    let name = path.into_inner();
    let summary = state
        .db
        .target_summary(name.trim(), state.config.recent_limit)
        .await?;
    let recent_reviews = present_many(&state, summary.recent_reviews, &viewer).await?;
    Ok(HttpResponse::Ok().json(TargetSummary {
        target_name: summary.target_name,
        average_rating: summary.average_rating,
        total_reviews: summary.total_reviews,
        rating_breakdown: summary.rating_breakdown,
        recent_reviews,
    }))
}

// GET /users/{id}/reviews
pub async fn user_reviews(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ListQuery>,
    viewer: MaybePrincipal,
) -> AppResult<HttpResponse> {
    let records = state
        .db
        .list_reviews(ReviewFilter::Author(&path), query.page(&state))
        .await?;
    Ok(HttpResponse::Ok().json(present_many(&state, records, &viewer).await?))
}

// GET /users/me/stats
pub async fn my_stats(state: web::Data<AppState>, principal: Principal) -> AppResult<HttpResponse> {
    let stats = state.db.author_stats(&principal.id).await?;
    Ok(HttpResponse::Ok().json(stats))
}

// GET /feedback
pub async fn list_feedback(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> AppResult<HttpResponse> {
    let entries = state.db.list_feedback(query.page(&state)).await?;
    Ok(HttpResponse::Ok().json(entries))
}

// POST /feedback
pub async fn submit_feedback(
    state: web::Data<AppState>,
    principal: Principal,
    body: web::Json<NewFeedback>,
) -> AppResult<HttpResponse> {
    let message = body.into_inner().validate()?;
    let entry = state.db.add_feedback(Some(&principal.id), message).await?;
    Ok(HttpResponse::Created().json(entry))
}

/// Turns extractor failures into the same error body handlers produce.
fn malformed(field: &str, err: impl std::fmt::Display) -> actix_web::Error {
    AppError::Validation(FieldErrors::single(field, err.to_string())).into()
}

/// Registers every JSON endpoint under the caller's scope.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _| malformed("body", err)))
        .app_data(web::QueryConfig::default().error_handler(|err, _| malformed("query", err)))
        .service(
            web::scope("/accounts")
                .route("/register", web::post().to(crate::accounts::register))
                .route("/token", web::post().to(crate::accounts::login))
                .route("/token/refresh", web::post().to(crate::accounts::refresh))
                .route("/logout", web::post().to(crate::accounts::logout))
                .route("/profile", web::get().to(crate::accounts::profile))
                .route("/profile", web::patch().to(crate::accounts::update_profile))
                .route(
                    "/profile/picture",
                    web::put().to(crate::accounts::upload_profile_picture),
                )
                .route(
                    "/profile/picture",
                    web::delete().to(crate::accounts::remove_profile_picture),
                ),
        )
        .route("/reviews", web::get().to(list_reviews))
        .route("/reviews", web::post().to(create_review))
        .route("/reviews/mine", web::get().to(my_reviews))
        .route("/reviews/{id}", web::get().to(get_review))
        .route("/reviews/{id}", web::patch().to(update_review))
        .route("/reviews/{id}", web::delete().to(delete_review))
        .route("/reviews/{id}/helpful", web::post().to(toggle_helpful))
        .route("/services/{name}/reviews", web::get().to(service_reviews))
        .route("/services/{name}/summary", web::get().to(service_summary))
        .route("/users/me/stats", web::get().to(my_stats))
        .route("/users/{id}/reviews", web::get().to(user_reviews))
        .route("/feedback", web::get().to(list_feedback))
        .route("/feedback", web::post().to(submit_feedback));
}
