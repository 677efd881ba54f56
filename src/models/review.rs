// src/models/review.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::FieldErrors;

pub const MAX_TARGET_NAME_LEN: usize = 200;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_COMMENT_LEN: usize = 1000;

const REQUIRED: &str = "This field is required.";

/// A star rating, always within `1..=5`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "i64", into = "i64")]
pub struct Rating(u8);

impl Rating {
    pub const MIN: i64 = 1;
    pub const MAX: i64 = 5;

    pub fn get(self) -> u8 {
        self.0
    }

    /// Filled and hollow stars, e.g. `★★★★☆` for 4.
    pub fn stars(self) -> String {
        let filled = usize::from(self.0);
        let hollow = Self::MAX as usize - filled;
        format!("{}{}", "★".repeat(filled), "☆".repeat(hollow))
    }

    /// Every valid star value, lowest first.
    pub fn all() -> impl Iterator<Item = Rating> {
        (Self::MIN..=Self::MAX).map(|v| Rating(v as u8))
    }
}

impl TryFrom<i64> for Rating {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Rating(value as u8))
        } else {
            Err(format!(
                "Rating must be between {} and {}.",
                Self::MIN,
                Self::MAX
            ))
        }
    }
}

impl From<Rating> for i64 {
    fn from(rating: Rating) -> Self {
        rating.0 as i64
    }
}

/// A stored review, exactly as the ledger holds it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Review {
    pub id: String,
    pub author_id: String,
    pub target_name: String,
    pub rating: Rating,
    pub title: String,
    pub comment: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_verified: bool,
    pub helpful_count: u32,
}

/// A review joined with the public parts of its author's profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRecord {
    pub review: Review,
    pub author_name: Option<String>,
    pub author_picture: Option<String>, // media file ref, not a URL
}

/// Client payload for creating a review. Fields stay raw and optional here so
/// that missing or out-of-range values surface as field errors, not parse errors.
#[derive(Deserialize, Debug, Clone)]
pub struct NewReview {
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default)]
    pub rating: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// A `NewReview` that passed validation.
#[derive(Debug, Clone)]
pub struct ValidReview {
    pub target_name: String,
    pub rating: Rating,
    pub title: String,
    pub comment: String,
}

impl NewReview {
    pub fn validate(self) -> Result<ValidReview, FieldErrors> {
        let mut errors = FieldErrors::default();

        let target_name = self.target_name.as_deref().unwrap_or_default().trim().to_string();
        if self.target_name.is_none() {
            errors.add("target_name", REQUIRED);
        } else if target_name.is_empty() {
            errors.add("target_name", "This field may not be blank.");
        } else if target_name.chars().count() > MAX_TARGET_NAME_LEN {
            errors.add(
                "target_name",
                format!("Ensure this field has no more than {MAX_TARGET_NAME_LEN} characters."),
            );
        }

        let rating = match self.rating {
            Some(value) => Rating::try_from(value).map_err(|e| errors.add("rating", e)).ok(),
            None => {
                errors.add("rating", REQUIRED);
                None
            }
        };
        let title = check_len(&mut errors, "title", self.title, MAX_TITLE_LEN);
        let comment = check_len(&mut errors, "comment", self.comment, MAX_COMMENT_LEN);

        match rating {
            Some(rating) if errors.is_empty() => Ok(ValidReview {
                target_name,
                rating,
                title,
                comment,
            }),
            _ => Err(errors),
        }
    }
}

/// Author-side edit. Absent fields are left untouched.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ReviewPatch {
    #[serde(default)]
    pub rating: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidPatch {
    pub rating: Option<Rating>,
    pub title: Option<String>,
    pub comment: Option<String>,
}

impl ReviewPatch {
    pub fn validate(self) -> Result<ValidPatch, FieldErrors> {
        let mut errors = FieldErrors::default();
        let rating = match self.rating {
            Some(value) => Rating::try_from(value).map_err(|e| errors.add("rating", e)).ok(),
            None => None,
        };
        let title = self
            .title
            .map(|t| check_len(&mut errors, "title", Some(t), MAX_TITLE_LEN));
        let comment = self
            .comment
            .map(|c| check_len(&mut errors, "comment", Some(c), MAX_COMMENT_LEN));

        if errors.is_empty() {
            Ok(ValidPatch {
                rating,
                title,
                comment,
            })
        } else {
            Err(errors)
        }
    }
}

fn check_len(errors: &mut FieldErrors, field: &str, value: Option<String>, max: usize) -> String {
    let value = value.map(|v| v.trim().to_string()).unwrap_or_default();
    if value.chars().count() > max {
        errors.add(
            field,
            format!("Ensure this field has no more than {max} characters."),
        );
    }
    value
}

/// Outcome of a helpful-vote toggle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelpfulToggle {
    pub helpful: bool,
    pub helpful_count: u32,
}

/// Read-only statistics for one target.
#[derive(Serialize, Debug, Clone)]
pub struct TargetSummary<R> {
    pub target_name: String,
    pub average_rating: f64,
    pub total_reviews: u32,
    pub rating_breakdown: BTreeMap<String, u32>,
    pub recent_reviews: Vec<R>,
}

/// Read-only statistics for one author.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthorStats {
    pub total_reviews: u32,
    pub average_rating_given: f64,
    pub recent_reviews: u32,
    pub verified_reviews: u32,
    pub helpful_votes_received: u32,
}

/// Arithmetic mean rounded to one decimal place; zero for an empty set.
pub fn rounded_average(sum: i64, count: u32) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (sum as f64 / count as f64 * 10.0).round() / 10.0
}
