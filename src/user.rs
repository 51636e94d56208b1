use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use validator::{Validate, ValidationError};

use crate::client::Error;

use std::fmt;
use std::sync::LazyLock;

pub const MAX_DISPLAY_NAME_CHARS: usize = 50;
pub const MAX_BIO_CHARS: usize = 256;
pub const MIN_USERNAME_CHARS: usize = 3;
pub const MIN_AGE_YEARS: u32 = 13;

static USERNAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_]+$").expect("Invalid username regex"));

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(#[serde(with = "string_or_number")] String);

impl UserId {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        UserId(id.to_string())
    }
}

/// Identifier the identity provider assigns to an account.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderUid(String);

impl ProviderUid {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ProviderUid {
    fn from(uid: &str) -> Self {
        ProviderUid(uid.to_string())
    }
}

/// A user handle, stored without the leading `@`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(String);

impl Handle {
    pub fn new(handle: &str) -> Self {
        Handle(handle.trim_start_matches('@').to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Handle::new(&raw))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[serde(rename = "SUPER.ADMIN")]
    SuperAdmin,
    #[serde(rename = "ADMIN")]
    Admin,
    #[default]
    #[serde(rename = "USER")]
    User,
    #[serde(rename = "GUEST")]
    Guest,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Profile {
    pub id: UserId,
    #[serde(rename = "firebase_uid", default)]
    pub provider_uid: Option<ProviderUid>,
    #[serde(rename = "username")]
    pub handle: Handle,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub banner_url: Option<String>,
    #[serde(rename = "followersCount", default)]
    pub follower_count: u64,
    #[serde(rename = "followsCount", default)]
    pub following_count: u64,
    #[serde(rename = "postsCount", default)]
    pub post_count: u64,
    #[serde(rename = "isFollowedByViewer", default)]
    pub is_followed_by_viewer: bool,
}

impl Profile {
    /// Display name, falling back to the handle when the user never set one.
    pub fn name(&self) -> &str {
        match self.display_name {
            Some(ref name) if !name.is_empty() => name.as_str(),
            _ => self.handle.as_str(),
        }
    }

    /// Flip `is_followed_by_viewer`, keeping `follower_count` in step and
    /// never below zero.
    pub fn toggle_follow(&mut self) {
        if self.is_followed_by_viewer {
            self.is_followed_by_viewer = false;
            self.follower_count = self.follower_count.saturating_sub(1);
        } else {
            self.is_followed_by_viewer = true;
            self.follower_count += 1;
        }
    }

    pub fn apply_update(&mut self, update: &UpdateProfile) {
        self.display_name = Some(update.display_name.clone());
        self.bio = Some(update.bio.clone());
        if let Some(ref url) = update.avatar_url {
            self.avatar_url = Some(url.clone());
        }
        if let Some(ref url) = update.banner_url {
            self.banner_url = Some(url.clone());
        }
    }
}

/// Body of `PUT /users/{uid}`.
#[derive(Serialize, Debug, Clone, PartialEq, Validate)]
pub struct UpdateProfile {
    #[validate(
        custom(function = "display_name_present"),
        length(max = 50, message = "Display name must be less than 50 characters")
    )]
    pub display_name: String,
    #[validate(length(max = 256, message = "Bio must be less than 256 characters"))]
    pub bio: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner_url: Option<String>,
}

impl UpdateProfile {
    pub fn validate(&self) -> Result<(), Error> {
        Validate::validate(self)
            .map_err(|errors| Error::from_validation(&errors, &["display_name", "bio"]))
    }
}

/// Sign-up form submitted by an authenticated but unregistered user.
#[derive(Debug, Clone, Validate)]
pub struct Registration {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(
        length(min = 3, message = "Username must be at least 3 characters"),
        regex(
            path = *USERNAME_REGEX,
            message = "Username can only contain letters, numbers, and underscores"
        )
    )]
    pub username: String,
    #[validate(custom(function = "display_name_present"))]
    pub display_name: String,
    pub date_of_birth: NaiveDate,
    #[validate(custom(function = "terms_accepted"))]
    pub accepted_terms: bool,
    pub avatar_url: Option<String>,
}

impl Registration {
    /// Field rules first, in form order, then the age limit as of `today`.
    pub fn validate(&self, today: NaiveDate) -> Result<(), Error> {
        Validate::validate(self).map_err(|errors| {
            Error::from_validation(
                &errors,
                &["email", "username", "display_name", "accepted_terms"],
            )
        })?;
        let age = today.years_since(self.date_of_birth).unwrap_or(0);
        if age < MIN_AGE_YEARS {
            return Err(Error::Validation(format!(
                "You must be at least {} years old",
                MIN_AGE_YEARS
            )));
        }
        Ok(())
    }
}

fn display_name_present(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::new("required").with_message("Display name is required".into()));
    }
    Ok(())
}

fn terms_accepted(accepted: &bool) -> Result<(), ValidationError> {
    if !*accepted {
        return Err(ValidationError::new("terms")
            .with_message("You must accept the terms and conditions".into()));
    }
    Ok(())
}

/// Last-known signed-in user, persisted locally so requests can carry the
/// viewer's uid before a fresh profile fetch completes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionUser {
    pub uid: ProviderUid,
    pub user_id: Option<UserId>,
    pub role: Role,
    pub handle: Handle,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
    pub email_verified: bool,
}

mod string_or_number {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize, Debug)]
    #[serde(untagged)]
    enum StringOrNumber {
        Number(i64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        match StringOrNumber::deserialize(deserializer)? {
            StringOrNumber::Number(n) => Ok(n.to_string()),
            StringOrNumber::Text(s) => Ok(s),
        }
    }

    pub fn serialize<S>(value: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn profile(handle: &str, followers: u64, followed: bool) -> Profile {
        Profile {
            id: UserId::from(format!("u-{}", handle).as_str()),
            provider_uid: None,
            handle: Handle::new(handle),
            display_name: Some(handle.to_string()),
            bio: None,
            avatar_url: None,
            banner_url: None,
            follower_count: followers,
            following_count: 0,
            post_count: 0,
            is_followed_by_viewer: followed,
        }
    }

    pub fn session_user(handle: &str) -> SessionUser {
        SessionUser {
            uid: ProviderUid::from(format!("uid-{}", handle).as_str()),
            user_id: Some(UserId::from(format!("u-{}", handle).as_str())),
            role: Role::User,
            handle: Handle::new(handle),
            display_name: Some(handle.to_string()),
            avatar_url: None,
            email: Some(format!("{}@example.com", handle)),
            email_verified: true,
        }
    }
}
