//! The REST surface the store talks to.

use async_trait::async_trait;
use hyper::Method;
use serde::Serialize;
use url::Url;

use crate::client::{Client, NoFields, Result};
use crate::notification::{Notification, NotificationFilter, UnreadCount};
use crate::post::{CreatePost, Cursor, FeedPage, Post, PostId, Thread};
use crate::query::FeedQuery;
use crate::search::{normalize_query, Hashtag, UserSearchResult};
use crate::user::{Handle, Profile, UpdateProfile, UserId};

#[async_trait]
pub trait SocialApi: Send + Sync {
    async fn feed_page(&self, query: &FeedQuery, cursor: Option<&Cursor>) -> Result<FeedPage>;
    async fn thread(&self, id: &PostId) -> Result<Thread>;
    async fn create_post(&self, post: &CreatePost) -> Result<Post>;
    async fn edit_post(&self, id: &PostId, content: &str) -> Result<()>;
    async fn delete_post(&self, id: &PostId) -> Result<()>;
    async fn like(&self, id: &PostId) -> Result<()>;
    async fn unlike(&self, id: &PostId) -> Result<()>;
    async fn repost(&self, id: &PostId) -> Result<()>;
    async fn profile(&self, handle: &Handle) -> Result<Profile>;
    async fn update_profile(&self, update: &UpdateProfile) -> Result<()>;
    async fn follow(&self, user: &UserId) -> Result<()>;
    async fn unfollow(&self, user: &UserId) -> Result<()>;
    async fn notifications(&self, filter: NotificationFilter) -> Result<Vec<Notification>>;
    async fn unread_count(&self) -> Result<u64>;
    async fn mark_notifications_read(&self) -> Result<()>;
    async fn trending_hashtags(&self) -> Result<Vec<Hashtag>>;
    async fn search_posts(&self, query: &str) -> Result<Vec<Post>>;
    async fn search_users(&self, query: &str) -> Result<Vec<UserSearchResult>>;
    async fn upload_media(&self, content_type: &str, bytes: Vec<u8>) -> Result<Url>;
}

#[derive(Serialize)]
struct PostRef<'a> {
    post_id: &'a PostId,
}

#[derive(Serialize)]
struct Content<'a> {
    content: &'a str,
}

#[async_trait]
impl SocialApi for Client {
    async fn feed_page(&self, query: &FeedQuery, cursor: Option<&Cursor>) -> Result<FeedPage> {
        let mut params: Vec<(&str, &str)> = vec![("cursor", cursor.map_or("0", Cursor::as_str))];
        if let Some(ref hashtag) = query.hashtag {
            params.push(("hashtag", hashtag.as_str()));
        }
        if let Some(ref author) = query.author {
            params.push(("author_handle", author.as_str()));
        }
        if let Some(tab) = query.tab {
            params.push(("tab", tab.as_str()));
        }
        params.push(("firebase_uid", self.viewer().as_str()));
        self.get("posts", &params).await
    }

    async fn thread(&self, id: &PostId) -> Result<Thread> {
        let path = format!("posts/{}/thread", id);
        self.get(&path, &[("firebase_uid", self.viewer().as_str())])
            .await
    }

    async fn create_post(&self, post: &CreatePost) -> Result<Post> {
        self.call(Method::POST, "posts", post).await
    }

    async fn edit_post(&self, id: &PostId, content: &str) -> Result<()> {
        let path = format!("posts/{}", id);
        self.call_empty(Method::PUT, &path, Content { content }).await
    }

    async fn delete_post(&self, id: &PostId) -> Result<()> {
        let path = format!("posts/{}", id);
        self.call_empty(Method::DELETE, &path, NoFields {}).await
    }

    async fn like(&self, id: &PostId) -> Result<()> {
        self.call_empty(Method::POST, "likes", PostRef { post_id: id })
            .await
    }

    async fn unlike(&self, id: &PostId) -> Result<()> {
        self.call_empty(Method::DELETE, "likes", PostRef { post_id: id })
            .await
    }

    async fn repost(&self, id: &PostId) -> Result<()> {
        let path = format!("posts/{}/repost", id);
        self.call_empty(Method::POST, &path, NoFields {}).await
    }

    async fn profile(&self, handle: &Handle) -> Result<Profile> {
        let path = format!("users/{}", handle.as_str());
        self.get(&path, &[("firebase_uid", self.viewer().as_str())])
            .await
    }

    async fn update_profile(&self, update: &UpdateProfile) -> Result<()> {
        let path = format!("users/{}", self.viewer().as_str());
        self.call_empty(Method::PUT, &path, update).await
    }

    async fn follow(&self, user: &UserId) -> Result<()> {
        let path = format!("users/{}/follow", user.as_str());
        self.call_empty(Method::POST, &path, NoFields {}).await
    }

    async fn unfollow(&self, user: &UserId) -> Result<()> {
        let path = format!("users/{}/follow", user.as_str());
        self.call_empty(Method::DELETE, &path, NoFields {}).await
    }

    async fn notifications(&self, filter: NotificationFilter) -> Result<Vec<Notification>> {
        let mut params = vec![("firebase_uid", self.viewer().as_str())];
        if let Some(kind) = filter.as_param() {
            params.push(("type", kind));
        }
        self.get("notifications", &params).await
    }

    async fn unread_count(&self) -> Result<u64> {
        let unread: UnreadCount = self
            .get(
                "notifications/unread-count",
                &[("firebase_uid", self.viewer().as_str())],
            )
            .await?;
        Ok(unread.count)
    }

    async fn mark_notifications_read(&self) -> Result<()> {
        self.call_empty(Method::POST, "notifications/mark-read", NoFields {})
            .await
    }

    async fn trending_hashtags(&self) -> Result<Vec<Hashtag>> {
        self.get("hashtags/trending", &[]).await
    }

    async fn search_posts(&self, query: &str) -> Result<Vec<Post>> {
        match normalize_query(query) {
            Some(q) => self.get("search/posts", &[("q", q.as_str())]).await,
            None => Ok(Vec::new()),
        }
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSearchResult>> {
        match normalize_query(query) {
            Some(q) => self.get("search/users", &[("q", q.as_str())]).await,
            None => Ok(Vec::new()),
        }
    }

    async fn upload_media(&self, content_type: &str, bytes: Vec<u8>) -> Result<Url> {
        self.upload(content_type, bytes).await
    }
}
