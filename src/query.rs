//! Structured cache keys.
//!
//! Every logical query the client can issue maps to exactly one
//! [`QueryKey`]. Keys compare structurally, so a hashtag feed for `cat` and
//! one for `cats`, or a hashtag `a` and an author `abc`, can never share an
//! entry. Broad operations such as "every feed" go through [`QueryScope`]
//! instead of prefix matching.

use serde::{Deserialize, Serialize};

use crate::notification::{Notification, NotificationFilter};
use crate::post::{Feed, Post, PostId, Thread};
use crate::search::{Hashtag, UserSearchResult};
use crate::user::{Handle, Profile};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProfileTab {
    Posts,
    Replies,
    Media,
    Videos,
    Likes,
}

impl ProfileTab {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileTab::Posts => "posts",
            ProfileTab::Replies => "replies",
            ProfileTab::Media => "media",
            ProfileTab::Videos => "videos",
            ProfileTab::Likes => "likes",
        }
    }
}

/// Parameters that distinguish one feed from another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FeedQuery {
    pub hashtag: Option<String>,
    pub author: Option<Handle>,
    pub tab: Option<ProfileTab>,
}

impl FeedQuery {
    pub fn home() -> Self {
        FeedQuery::default()
    }

    /// Hashtags are matched case-insensitively and without the leading `#`.
    pub fn hashtag(tag: &str) -> Self {
        FeedQuery {
            hashtag: Some(tag.trim_start_matches('#').to_lowercase()),
            ..FeedQuery::default()
        }
    }

    pub fn author(handle: Handle, tab: ProfileTab) -> Self {
        FeedQuery {
            author: Some(handle),
            tab: Some(tab),
            ..FeedQuery::default()
        }
    }

    pub fn is_home(&self) -> bool {
        self.hashtag.is_none() && self.author.is_none() && self.tab.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Feed(FeedQuery),
    Thread(PostId),
    Profile(Handle),
    Notifications(NotificationFilter),
    UnreadCount,
    TrendingHashtags,
    SearchPosts(String),
    SearchUsers(String),
}

impl QueryKey {
    pub fn home_feed() -> Self {
        QueryKey::Feed(FeedQuery::home())
    }
}

/// A selection of keys used for cancellation and invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    Key(QueryKey),
    AllFeeds,
    AllThreads,
    AllNotifications,
    AllSearches,
}

impl QueryScope {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match (self, key) {
            (QueryScope::Key(k), key) => k == key,
            (QueryScope::AllFeeds, QueryKey::Feed(_)) => true,
            (QueryScope::AllThreads, QueryKey::Thread(_)) => true,
            (QueryScope::AllNotifications, QueryKey::Notifications(_))
            | (QueryScope::AllNotifications, QueryKey::UnreadCount) => true,
            (QueryScope::AllSearches, QueryKey::SearchPosts(_))
            | (QueryScope::AllSearches, QueryKey::SearchUsers(_)) => true,
            _ => false,
        }
    }
}

impl From<QueryKey> for QueryScope {
    fn from(key: QueryKey) -> Self {
        QueryScope::Key(key)
    }
}

/// A cached query result.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
    Feed(Feed),
    Thread(Thread),
    Profile(Profile),
    Notifications(Vec<Notification>),
    UnreadCount(u64),
    Hashtags(Vec<Hashtag>),
    PostResults(Vec<Post>),
    UserResults(Vec<UserSearchResult>),
}

impl QueryData {
    pub fn as_feed(&self) -> Option<&Feed> {
        match self {
            QueryData::Feed(feed) => Some(feed),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&Thread> {
        match self {
            QueryData::Thread(thread) => Some(thread),
            _ => None,
        }
    }

    pub fn as_profile(&self) -> Option<&Profile> {
        match self {
            QueryData::Profile(profile) => Some(profile),
            _ => None,
        }
    }

    /// Every post held by this value, for the shapes that hold posts.
    pub fn posts(&self) -> Box<dyn Iterator<Item = &Post> + '_> {
        match self {
            QueryData::Feed(feed) => Box::new(feed.posts()),
            QueryData::Thread(thread) => {
                Box::new(std::iter::once(&thread.post).chain(thread.replies.iter()))
            }
            QueryData::PostResults(posts) => Box::new(posts.iter()),
            _ => Box::new(std::iter::empty()),
        }
    }

    pub fn posts_mut(&mut self) -> Box<dyn Iterator<Item = &mut Post> + '_> {
        match self {
            QueryData::Feed(feed) => Box::new(feed.posts_mut()),
            QueryData::Thread(thread) => Box::new(thread.posts_mut()),
            QueryData::PostResults(posts) => Box::new(posts.iter_mut()),
            _ => Box::new(std::iter::empty()),
        }
    }

    pub fn find_post(&self, id: &PostId) -> Option<&Post> {
        self.posts().find(|post| &post.id == id)
    }

    /// Run `f` on every copy of post `id`. Returns whether any was found.
    pub fn update_post<F>(&mut self, id: &PostId, mut f: F) -> bool
    where
        F: FnMut(&mut Post),
    {
        let mut found = false;
        for post in self.posts_mut() {
            if &post.id == id {
                f(post);
                found = true;
            }
        }
        found
    }

    /// Drop post `id` wherever it appears. Removing a thread's root post is
    /// not possible here; callers invalidate the thread instead.
    pub fn remove_post(&mut self, id: &PostId) {
        match self {
            QueryData::Feed(feed) => feed.remove(id),
            QueryData::Thread(thread) => thread.replies.retain(|post| &post.id != id),
            QueryData::PostResults(posts) => posts.retain(|post| &post.id != id),
            _ => {}
        }
    }

    /// Replace post `old` with `replacement` in place, keeping its position.
    pub fn replace_post(&mut self, old: &PostId, replacement: &Post) {
        for post in self.posts_mut() {
            if &post.id == old {
                *post = replacement.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post::fixtures::*;

    #[test]
    fn hashtag_keys_do_not_collide() {
        let cat = QueryKey::Feed(FeedQuery::hashtag("cat"));
        let cats = QueryKey::Feed(FeedQuery::hashtag("cats"));
        assert_ne!(cat, cats);
        assert!(!QueryScope::Key(cat.clone()).matches(&cats));
        assert!(QueryScope::Key(cat.clone()).matches(&cat));
    }

    #[test]
    fn hashtag_and_author_never_match() {
        let tag = QueryKey::Feed(FeedQuery::hashtag("a"));
        let author = QueryKey::Feed(FeedQuery::author(Handle::new("abc"), ProfileTab::Posts));
        assert_ne!(tag, author);
    }

    #[test]
    fn hashtag_keys_are_normalized() {
        assert_eq!(FeedQuery::hashtag("#Cat"), FeedQuery::hashtag("cat"));
        assert!(FeedQuery::home().is_home());
        assert!(!FeedQuery::hashtag("cat").is_home());
    }

    #[test]
    fn scopes_select_by_kind() {
        let feed = QueryKey::home_feed();
        let thread = QueryKey::Thread(PostId::from("p1"));
        let unread = QueryKey::UnreadCount;

        assert!(QueryScope::AllFeeds.matches(&feed));
        assert!(!QueryScope::AllFeeds.matches(&thread));
        assert!(QueryScope::AllThreads.matches(&thread));
        assert!(QueryScope::AllNotifications.matches(&unread));
        assert!(QueryScope::AllNotifications
            .matches(&QueryKey::Notifications(NotificationFilter::Mentions)));
        assert!(!QueryScope::AllNotifications.matches(&feed));
        assert!(QueryScope::AllSearches.matches(&QueryKey::SearchPosts("rust".to_string())));
        assert!(!QueryScope::AllSearches.matches(&QueryKey::TrendingHashtags));
    }

    #[test]
    fn update_post_reaches_thread_replies() {
        let mut data = QueryData::Thread(Thread {
            post: post("root", 0, false),
            replies: vec![post("r1", 1, false), post("r2", 2, false)],
        });
        assert!(data.update_post(&PostId::from("r2"), |p| p.toggle_like()));
        assert_eq!(data.find_post(&PostId::from("r2")).unwrap().like_count, 3);
        assert!(!data.update_post(&PostId::from("missing"), |p| p.toggle_like()));
    }

    #[test]
    fn replace_keeps_position() {
        let mut data = QueryData::Feed(Feed {
            pages: vec![page(&["t", "p5", "p4"], None)],
        });
        data.replace_post(&PostId::from("t"), &post("p9", 0, false));
        let ids: Vec<_> = data.posts().map(|p| p.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["p9", "p5", "p4"]);
    }
}
