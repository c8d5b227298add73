//! Topic name validation.
//!
//! A topic name must:
//! - not be empty;
//! - be at most 249 characters;
//! - contain only ASCII alphanumerics, `.`, `_` and `-`;
//! - not be `.` or `..`.
//!
//! Partition directories are named `<topic>-<partition>`, so these rules
//! also keep every name a safe single path component.
//!
//! ```
//! use jockey::cluster::validate_topic_name;
//!
//! assert!(validate_topic_name("orders").is_ok());
//! assert!(validate_topic_name("orders.v2_eu-west").is_ok());
//! assert!(validate_topic_name("").is_err());
//! assert!(validate_topic_name("..").is_err());
//! assert!(validate_topic_name("a/b").is_err());
//! ```

use super::error::{ClusterError, ClusterResult};
use crate::constants::MAX_TOPIC_NAME_LEN;

pub fn validate_topic_name(topic: &str) -> ClusterResult<()> {
    if topic.is_empty() {
        return Err(ClusterError::InvalidTopic(
            "topic name cannot be empty".to_string(),
        ));
    }

    if topic.len() > MAX_TOPIC_NAME_LEN {
        return Err(ClusterError::InvalidTopic(format!(
            "'{}' is too long ({} chars, max {})",
            truncate_for_display(topic, 50),
            topic.len(),
            MAX_TOPIC_NAME_LEN
        )));
    }

    if topic == "." || topic == ".." {
        return Err(ClusterError::InvalidTopic(format!(
            "'{topic}' is a reserved name"
        )));
    }

    if let Some((i, c)) = topic
        .chars()
        .enumerate()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(ClusterError::InvalidTopic(format!(
            "invalid character '{}' (U+{:04X}) at position {i}; only ASCII letters, digits, '.', '_' and '-' are allowed",
            c.escape_default(),
            c as u32,
        )));
    }

    Ok(())
}

/// Keep overly long names out of error messages.
fn truncate_for_display(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len])
    }
}
