use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FieldErrors;

pub const MAX_MESSAGE_LEN: usize = 5000;

/// An entry in the append-only feedback log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Feedback {
    pub id: String,
    pub author_id: Option<String>, // None for anonymous entries
    pub author_name: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewFeedback {
    #[serde(default)]
    pub message: String,
}

impl NewFeedback {
    pub fn validate(self) -> Result<String, FieldErrors> {
        let message = self.message.trim().to_string();
        let mut errors = FieldErrors::default();
        if message.is_empty() {
            errors.add("message", "This field may not be blank.");
        } else if message.chars().count() > MAX_MESSAGE_LEN {
            errors.add(
                "message",
                format!("Ensure this field has no more than {MAX_MESSAGE_LEN} characters."),
            );
        }
        if errors.is_empty() {
            Ok(message)
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_required() {
        let blank = NewFeedback {
            message: " \n ".into(),
        };
        assert!(blank.validate().unwrap_err().get("message").is_some());

        let ok = NewFeedback {
            message: " Love the new search ".into(),
        };
        assert_eq!(ok.validate().unwrap(), "Love the new search");
    }
}
