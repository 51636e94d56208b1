use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize};
use url::Url;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::client::Error;
use crate::user::{Handle, UserId};

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

/// Prefix carried by ids the client invents for optimistic posts.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Longest post the composer accepts, in characters.
pub const MAX_POST_CHARS: usize = 300;

static HASHTAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([A-Za-z0-9_]+)").expect("Invalid hashtag regex"));

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PostId(String);

impl PostId {
    /// Mint an id for an optimistic post. It can never equal a server id
    /// because server payloads carrying the prefix are rejected.
    pub fn temporary() -> Self {
        PostId(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PostId {
    fn from(id: &str) -> Self {
        PostId(id.to_string())
    }
}

impl<'de> Deserialize<'de> for PostId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let id = String::deserialize(deserializer)?;
        if id.is_empty() {
            return Err(de::Error::custom("post id is empty"));
        }
        if id.starts_with(TEMP_ID_PREFIX) {
            return Err(de::Error::custom(format!(
                "server post id {:?} uses the reserved {:?} prefix",
                id, TEMP_ID_PREFIX
            )));
        }
        Ok(PostId(id))
    }
}

/// Denormalized author snapshot embedded in every post.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Author {
    pub id: UserId,
    #[serde(rename = "name")]
    pub display_name: String,
    pub handle: Handle,
    #[serde(rename = "avatar", default)]
    pub avatar_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub content: String,
    pub author: Author,
    #[serde(rename = "likes", default)]
    pub like_count: u64,
    #[serde(default)]
    pub liked_by_viewer: bool,
    #[serde(rename = "reposts", default)]
    pub repost_count: u64,
    #[serde(rename = "replies", default)]
    pub reply_count: u64,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edit_count: Option<u32>,
    #[serde(rename = "image", default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub parent_id: Option<PostId>,
}

impl Post {
    /// Flip `liked_by_viewer` from its current value, keeping the count in
    /// step. The count never drops below zero.
    pub fn toggle_like(&mut self) {
        if self.liked_by_viewer {
            self.liked_by_viewer = false;
            self.like_count = self.like_count.saturating_sub(1);
        } else {
            self.liked_by_viewer = true;
            self.like_count += 1;
        }
    }

    pub fn record_repost(&mut self) {
        self.repost_count += 1;
    }

    pub fn apply_edit(&mut self, content: &str, at: DateTime<Utc>) {
        self.content = content.to_string();
        self.edited_at = Some(at);
        self.edit_count = Some(self.edit_count.unwrap_or(0) + 1);
    }

    pub fn is_edited(&self) -> bool {
        self.edited_at.is_some()
    }

    pub fn hashtags(&self) -> Vec<String> {
        extract_hashtags(&self.content)
    }
}

/// Opaque continuation token. The server sends either a number or a string.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for Cursor {
    fn from(cursor: &str) -> Self {
        Cursor(cursor.to_string())
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawCursor {
            Number(i64),
            Text(String),
        }

        match RawCursor::deserialize(deserializer)? {
            RawCursor::Number(n) => Ok(Cursor(n.to_string())),
            RawCursor::Text(s) => Ok(Cursor(s)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub posts: Vec<Post>,
    #[serde(default)]
    pub next_cursor: Option<Cursor>,
}

/// All pages loaded so far for one feed query, oldest page last.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Feed {
    pub pages: Vec<FeedPage>,
}

impl Feed {
    pub fn from_first_page(page: FeedPage) -> Self {
        Feed { pages: vec![page] }
    }

    /// Put `post` at the head of page 0. Every other post and page keeps
    /// its position.
    pub fn prepend(&mut self, post: Post) {
        match self.pages.first_mut() {
            Some(first) => first.posts.insert(0, post),
            None => self.pages.push(FeedPage {
                posts: vec![post],
                next_cursor: None,
            }),
        }
    }

    pub fn push_page(&mut self, page: FeedPage) {
        self.pages.push(page);
    }

    pub fn next_cursor(&self) -> Option<&Cursor> {
        self.pages.last().and_then(|page| page.next_cursor.as_ref())
    }

    pub fn has_more(&self) -> bool {
        self.next_cursor().is_some()
    }

    pub fn posts(&self) -> impl Iterator<Item = &Post> {
        self.pages.iter().flat_map(|page| page.posts.iter())
    }

    pub fn posts_mut(&mut self) -> impl Iterator<Item = &mut Post> {
        self.pages.iter_mut().flat_map(|page| page.posts.iter_mut())
    }

    pub fn remove(&mut self, id: &PostId) {
        for page in &mut self.pages {
            page.posts.retain(|post| &post.id != id);
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Thread {
    pub post: Post,
    #[serde(default)]
    pub replies: Vec<Post>,
}

impl Thread {
    pub fn posts_mut(&mut self) -> impl Iterator<Item = &mut Post> {
        std::iter::once(&mut self.post).chain(self.replies.iter_mut())
    }
}

/// Body of `POST /posts`.
#[derive(Serialize, Debug, Clone, Validate)]
pub struct CreatePost {
    #[validate(
        custom(function = "content_present"),
        length(max = 300, message = "Post must be less than 300 characters")
    )]
    pub content: String,
    pub media_url: Option<Url>,
    pub parent_id: Option<PostId>,
}

impl CreatePost {
    pub fn new(content: &str) -> Self {
        CreatePost {
            content: content.to_string(),
            media_url: None,
            parent_id: None,
        }
    }

    pub fn reply_to(mut self, parent: PostId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_media(mut self, url: Url) -> Self {
        self.media_url = Some(url);
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        Validate::validate(self)?;
        Ok(())
    }
}

fn content_present(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::new("required").with_message("Content is required".into()));
    }
    Ok(())
}

/// Check post text on its own, as when editing.
pub fn validate_content(content: &str) -> Result<(), Error> {
    CreatePost::new(content).validate()
}

/// Extract #hashtags from post content, lowercased, deduplicated in order of
/// first appearance.
pub fn extract_hashtags(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    HASHTAG_REGEX
        .captures_iter(content)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_lowercase()))
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn toggle_like_twice_restores_state() {
        let mut p = post("p1", 3, false);
        p.toggle_like();
        assert_eq!((p.like_count, p.liked_by_viewer), (4, true));
        p.toggle_like();
        assert_eq!((p.like_count, p.liked_by_viewer), (3, false));
    }

    #[test]
    fn unlike_never_goes_negative() {
        let mut p = post("p1", 0, true);
        p.toggle_like();
        assert_eq!(p.like_count, 0);
        assert!(!p.liked_by_viewer);
    }

    #[test]
    fn temporary_ids_are_marked() {
        let id = PostId::temporary();
        assert!(id.is_temporary());
        assert!(!PostId::from("8f0c").is_temporary());
        assert_ne!(PostId::temporary(), PostId::temporary());

        let wire = serde_json::to_value(&id).unwrap();
        let text = wire.as_str().unwrap();
        assert_eq!(text, id.as_str());
        assert!(Uuid::parse_str(&text[TEMP_ID_PREFIX.len()..]).is_ok());
    }

    #[test]
    fn server_payload_with_temp_prefix_is_rejected() {
        let err = serde_json::from_str::<PostId>("\"temp-123\"").unwrap_err();
        assert!(err.to_string().contains("reserved"));
        assert!(serde_json::from_str::<PostId>("\"\"").is_err());
    }

    #[test]
    fn deserialize_server_post() {
        let json = r#"{
            "id": "p9",
            "content": "hello #world",
            "timestamp": "2024-05-01T12:00:00Z",
            "likes": 2,
            "replies": 1,
            "reposts": 0,
            "likedByViewer": true,
            "author": {"id": "u1", "name": "Alice", "handle": "@alice", "avatar": "https://a/b.png"}
        }"#;
        let post: Post = serde_json::from_str(json).unwrap();
        assert_eq!(post.id, PostId::from("p9"));
        assert_eq!(post.like_count, 2);
        assert!(post.liked_by_viewer);
        assert_eq!(post.author.handle.as_str(), "alice");
        assert_eq!(post.hashtags(), vec!["world"]);
    }

    #[test]
    fn cursor_accepts_numbers_and_strings() {
        let page: FeedPage = serde_json::from_str(r#"{"posts": [], "nextCursor": 20}"#).unwrap();
        assert_eq!(page.next_cursor, Some(Cursor::from("20")));
        let page: FeedPage = serde_json::from_str(r#"{"posts": [], "nextCursor": "abc"}"#).unwrap();
        assert_eq!(page.next_cursor, Some(Cursor::from("abc")));
        let page: FeedPage = serde_json::from_str(r#"{"posts": [], "nextCursor": null}"#).unwrap();
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn prepend_touches_only_head_of_first_page() {
        let mut feed = Feed {
            pages: vec![page(&["p5", "p4", "p3"], Some("3")), page(&["p2", "p1"], None)],
        };
        let before = feed.clone();
        feed.prepend(post("new", 0, false));

        assert_eq!(feed.pages[0].posts.len(), 4);
        assert_eq!(feed.pages[0].posts[0].id, PostId::from("new"));
        assert_eq!(&feed.pages[0].posts[1..], &before.pages[0].posts[..]);
        assert_eq!(feed.pages[1], before.pages[1]);
    }

    #[test]
    fn prepend_into_empty_feed_creates_first_page() {
        let mut feed = Feed::default();
        feed.prepend(post("new", 0, false));
        assert_eq!(feed.pages.len(), 1);
        assert_eq!(feed.pages[0].next_cursor, None);
    }

    #[test]
    fn hashtags_are_deduplicated_and_lowercased() {
        assert_eq!(
            extract_hashtags("#Cat and #cats and #cat again"),
            vec!["cat", "cats"]
        );
        assert!(extract_hashtags("no tags here").is_empty());
    }

    #[test]
    fn content_validation() {
        assert!(validate_content("hello").is_ok());
        assert!(validate_content(&"x".repeat(MAX_POST_CHARS)).is_ok());
        assert!(validate_content(&"é".repeat(MAX_POST_CHARS)).is_ok());

        match validate_content(" \n ") {
            Err(Error::Validation(message)) => assert_eq!(message, "Content is required"),
            other => panic!("{:?}", other),
        }
        match CreatePost::new(&"x".repeat(MAX_POST_CHARS + 1)).validate() {
            Err(Error::Validation(message)) => {
                assert_eq!(message, "Post must be less than 300 characters")
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn edit_bumps_count() {
        let mut p = post("p1", 0, false);
        p.apply_edit("changed", Utc::now());
        p.apply_edit("changed again", Utc::now());
        assert_eq!(p.edit_count, Some(2));
        assert!(p.is_edited());
        assert_eq!(p.content, "changed again");
    }
}
