use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FieldErrors;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_USERNAME_LEN: usize = 150;

/// The authenticated identity handed to the review core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub username: String,
    pub is_admin: bool,
}

/// Stored account. The password hash never leaves the identity module.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub birthday: Option<NaiveDate>,
    pub profile_picture: Option<String>, // media file ref
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

/// Profile as returned to its owner.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProfileView {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub birthday: Option<NaiveDate>,
    pub profile_picture: Option<String>, // absolute or prefixed URL
}

#[derive(Deserialize, Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    pub password: String,
    pub confirm_password: String,
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
}

/// A registration that passed field validation; uniqueness is checked by storage.
#[derive(Debug, Clone)]
pub struct ValidRegistration {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
    pub birthday: Option<NaiveDate>,
}

impl Registration {
    pub fn validate(self) -> Result<ValidRegistration, FieldErrors> {
        let mut errors = FieldErrors::default();

        let username = self.username.trim().to_string();
        if let Err(e) = check_username(&username) {
            errors.add("username", e);
        }
        let email = self.email.trim().to_string();
        if let Err(e) = check_email(&email) {
            errors.add("email", e);
        }
        for problem in password_problems(&self.password) {
            errors.add("password", problem);
        }
        if self.password != self.confirm_password {
            errors.add("confirm_password", "Passwords do not match.");
        }

        let full_name = self.full_name.trim();
        let (first_name, last_name) = match full_name.split_once(char::is_whitespace) {
            Some((first, last)) => (first.to_string(), last.trim().to_string()),
            None => (full_name.to_string(), String::new()),
        };

        if errors.is_empty() {
            Ok(ValidRegistration {
                username,
                email,
                first_name,
                last_name,
                password: self.password,
                birthday: self.birthday,
            })
        } else {
            Err(errors)
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    pub access_expires_at: DateTime<Utc>,
}

/// Owner-side profile edit. `birthday: null` clears it.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProfilePatch {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub birthday: Option<Option<NaiveDate>>,
}

impl ProfilePatch {
    pub fn validate(mut self) -> Result<Self, FieldErrors> {
        let mut errors = FieldErrors::default();
        if let Some(email) = self.email.as_mut() {
            *email = email.trim().to_string();
            if let Err(e) = check_email(email) {
                errors.add("email", e);
            }
        }
        for (field, value) in [
            ("first_name", self.first_name.as_mut()),
            ("last_name", self.last_name.as_mut()),
        ] {
            if let Some(value) = value {
                *value = value.trim().to_string();
                if value.chars().count() > MAX_USERNAME_LEN {
                    errors.add(
                        field,
                        format!(
                            "Ensure this field has no more than {MAX_USERNAME_LEN} characters."
                        ),
                    );
                }
            }
        }
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(errors)
        }
    }
}

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

pub fn check_username(username: &str) -> Result<(), String> {
    let len = username.chars().count();
    if !(3..=MAX_USERNAME_LEN).contains(&len) {
        return Err(format!(
            "Username must be between 3 and {MAX_USERNAME_LEN} characters."
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@.+-_".contains(c))
    {
        return Err("Username may contain only letters, digits and @/./+/-/_.".into());
    }
    Ok(())
}

pub fn check_email(email: &str) -> Result<(), String> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err("Enter a valid email address.".into())
    }
}

/// Password rules: minimum length, one uppercase letter, one digit.
pub fn password_problems(password: &str) -> Vec<String> {
    let mut problems = Vec::new();
    if password.chars().count() < MIN_PASSWORD_LEN {
        problems.push(format!(
            "The password must be at least {MIN_PASSWORD_LEN} characters long."
        ));
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        problems.push("The password must contain at least one uppercase letter.".into());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        problems.push("The password must contain at least one digit.".into());
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> Registration {
        Registration {
            username: "alice".into(),
            email: "alice@example.com".into(),
            full_name: "Alice  van Dijk".into(),
            password: "Secret123".into(),
            confirm_password: "Secret123".into(),
            birthday: None,
        }
    }

    #[test]
    fn test_password_rules() {
        assert!(password_problems("Secret123").is_empty());
        assert_eq!(password_problems("short1A").len(), 1);
        assert_eq!(password_problems("alllowercase").len(), 2);
    }

    #[test]
    fn test_email_shape() {
        assert!(check_email("a@b.io").is_ok());
        for bad in ["", "plain", "@b.io", "a@b", "a@.io", "a@b.io.", "a@b@c.io"] {
            assert!(check_email(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_registration_splits_full_name() {
        let valid = registration().validate().unwrap();
        assert_eq!(valid.first_name, "Alice");
        assert_eq!(valid.last_name, "van Dijk");
    }

    #[test]
    fn test_registration_collects_field_errors() {
        let bad = Registration {
            username: "a b".into(),
            confirm_password: "Other123".into(),
            ..registration()
        };
        let errors = bad.validate().unwrap_err();
        assert!(errors.get("username").is_some());
        assert!(errors.get("confirm_password").is_some());
        assert!(errors.get("email").is_none());
    }

    #[test]
    fn test_profile_patch_birthday_null_clears() {
        let patch: ProfilePatch = serde_json::from_str(r#"{"birthday": null}"#).unwrap();
        assert_eq!(patch.birthday, Some(None));
        let patch: ProfilePatch = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(patch.birthday, None);
    }
}
