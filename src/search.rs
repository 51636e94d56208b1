use serde::{Deserialize, Serialize};

use crate::user::{Handle, UserId};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Hashtag {
    pub tag: String,
    pub count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserSearchResult {
    pub id: UserId,
    #[serde(rename = "username")]
    pub handle: Handle,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

/// Normalize a search box value. `None` means there is nothing to search.
pub fn normalize_query(query: &str) -> Option<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
