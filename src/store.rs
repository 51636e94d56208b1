//! User-level operations: cached reads and optimistic writes.

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, trace, warn};
use url::Url;

use crate::api::SocialApi;
use crate::cache::QueryCache;
use crate::client::{Error, Result};
use crate::mutation::{Mutation, MutationExecutor, Notifier};
use crate::notification::{Notification, NotificationFilter};
use crate::post::{extract_hashtags, validate_content, CreatePost, Feed, Post, PostId, Thread};
use crate::query::{FeedQuery, ProfileTab, QueryData, QueryKey, QueryScope};
use crate::search::{Hashtag, UserSearchResult};
use crate::session::SessionContext;
use crate::user::{Handle, Profile, UpdateProfile};

use std::fmt;
use std::sync::Arc;

/// Every scope that can hold a copy of a post.
fn post_scopes() -> [QueryScope; 3] {
    [
        QueryScope::AllFeeds,
        QueryScope::AllThreads,
        QueryScope::AllSearches,
    ]
}

fn touching_posts<R>(mut mutation: Mutation<R>) -> Mutation<R> {
    for scope in post_scopes() {
        mutation = mutation.affecting(scope);
    }
    mutation
}

/// Updater running `f` on every cached copy of post `id`.
fn on_post<F>(id: PostId, f: F) -> impl Fn(Option<&QueryData>) -> Option<QueryData> + Send + Sync + 'static
where
    F: Fn(&mut Post) + Send + Sync + 'static,
{
    move |old: Option<&QueryData>| {
        old.cloned().map(|mut data| {
            data.update_post(&id, &f);
            data
        })
    }
}

fn reject_temporary(id: &PostId) -> Result<()> {
    if id.is_temporary() {
        return Err(Error::Validation(
            "This post is still being published".to_string(),
        ));
    }
    Ok(())
}

fn shape_error(key: &QueryKey) -> Error {
    Error::CacheShape(format!("{:?}", key))
}

#[derive(Clone)]
pub struct Store {
    api: Arc<dyn SocialApi>,
    executor: MutationExecutor,
    session: SessionContext,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Store({}, {:?})", self.session.handle(), self.executor)
    }
}

impl Store {
    pub fn new(api: Arc<dyn SocialApi>, session: SessionContext, notifier: Arc<dyn Notifier>) -> Self {
        Store {
            api,
            executor: MutationExecutor::new(QueryCache::new(), notifier),
            session,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        self.executor.cache()
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    async fn fetch_remote(&self, key: &QueryKey) -> Result<QueryData> {
        let data = match key {
            QueryKey::Feed(query) => {
                let page = self.api.feed_page(query, None).await?;
                QueryData::Feed(Feed::from_first_page(page))
            }
            QueryKey::Thread(id) => {
                reject_temporary(id)?;
                QueryData::Thread(self.api.thread(id).await?)
            }
            QueryKey::Profile(handle) => QueryData::Profile(self.api.profile(handle).await?),
            QueryKey::Notifications(filter) => {
                QueryData::Notifications(self.api.notifications(*filter).await?)
            }
            QueryKey::UnreadCount => QueryData::UnreadCount(self.api.unread_count().await?),
            QueryKey::TrendingHashtags => QueryData::Hashtags(self.api.trending_hashtags().await?),
            QueryKey::SearchPosts(q) => QueryData::PostResults(self.api.search_posts(q).await?),
            QueryKey::SearchUsers(q) => QueryData::UserResults(self.api.search_users(q).await?),
        };
        Ok(data)
    }

    /// Fetch `key` from the server now. A feed restarts from its first page.
    pub async fn refetch(&self, key: &QueryKey) -> Result<QueryData> {
        self.cache().fetch(key, self.fetch_remote(key)).await
    }

    /// Refetch every stale cached key concurrently. Returns how many were
    /// refreshed; failures are logged and leave their key stale.
    pub async fn refetch_stale(&self) -> usize {
        let keys = self.cache().stale_keys();
        let results = join_all(keys.iter().map(|key| self.refetch(key))).await;
        let mut refreshed = 0;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(_) => refreshed += 1,
                Err(err) => warn!(?key, error = %err, "refetch failed"),
            }
        }
        refreshed
    }

    /// Refresh `key` on a background task unless a fetch for its current
    /// generation is already running.
    fn refetch_in_background(&self, key: QueryKey) {
        let ticket = match self.cache().try_begin_fetch(&key) {
            Some(ticket) => ticket,
            None => {
                trace!(?key, "refetch already in flight");
                return;
            }
        };
        let store = self.clone();
        tokio::spawn(async move {
            let fetched = store.cache().fetch_as(ticket, store.fetch_remote(&key)).await;
            if let Err(err) = fetched {
                warn!(?key, error = %err, "background refetch failed");
            }
        });
    }

    /// Cached value for `key`. A stale value is returned as is and refreshed
    /// in the background; a missing one is fetched first.
    async fn load(&self, key: QueryKey) -> Result<QueryData> {
        if let Some(data) = self.cache().get(&key) {
            if self.cache().is_stale(&key) {
                debug!(?key, "serving stale value");
                self.refetch_in_background(key);
            }
            return Ok(data);
        }
        self.refetch(&key).await
    }

    pub async fn feed(&self, query: &FeedQuery) -> Result<Feed> {
        let key = QueryKey::Feed(query.clone());
        match self.load(key.clone()).await? {
            QueryData::Feed(feed) => Ok(feed),
            _ => Err(shape_error(&key)),
        }
    }

    /// Append the next page of a cached feed. Returns false when there is no
    /// further page or the result was discarded.
    pub async fn load_more(&self, query: &FeedQuery) -> Result<bool> {
        let key = QueryKey::Feed(query.clone());
        let cursor = match self
            .cache()
            .get(&key)
            .and_then(|data| data.as_feed().and_then(|feed| feed.next_cursor().cloned()))
        {
            Some(cursor) => cursor,
            None => return Ok(false),
        };

        let ticket = self.cache().begin_fetch(&key);
        let page = match self.api.feed_page(query, Some(&cursor)).await {
            Ok(page) => page,
            Err(err) => {
                self.cache().abandon_fetch(ticket);
                return Err(err);
            }
        };
        Ok(self.cache().complete_fetch_with(ticket, move |base| {
            let mut feed = base.and_then(QueryData::as_feed).cloned().unwrap_or_default();
            feed.push_page(page);
            QueryData::Feed(feed)
        }))
    }

    pub async fn thread(&self, id: &PostId) -> Result<Thread> {
        let key = QueryKey::Thread(id.clone());
        match self.load(key.clone()).await? {
            QueryData::Thread(thread) => Ok(thread),
            _ => Err(shape_error(&key)),
        }
    }

    pub async fn profile(&self, handle: &Handle) -> Result<Profile> {
        let key = QueryKey::Profile(handle.clone());
        match self.load(key.clone()).await? {
            QueryData::Profile(profile) => Ok(profile),
            _ => Err(shape_error(&key)),
        }
    }

    pub async fn notifications(&self, filter: NotificationFilter) -> Result<Vec<Notification>> {
        let key = QueryKey::Notifications(filter);
        match self.load(key.clone()).await? {
            QueryData::Notifications(notifications) => Ok(notifications),
            _ => Err(shape_error(&key)),
        }
    }

    pub async fn unread_count(&self) -> Result<u64> {
        let key = QueryKey::UnreadCount;
        match self.load(key.clone()).await? {
            QueryData::UnreadCount(count) => Ok(count),
            _ => Err(shape_error(&key)),
        }
    }

    pub async fn trending_hashtags(&self) -> Result<Vec<Hashtag>> {
        let key = QueryKey::TrendingHashtags;
        match self.load(key.clone()).await? {
            QueryData::Hashtags(tags) => Ok(tags),
            _ => Err(shape_error(&key)),
        }
    }

    pub async fn search_posts(&self, query: &str) -> Result<Vec<Post>> {
        let key = QueryKey::SearchPosts(query.trim().to_string());
        match self.load(key.clone()).await? {
            QueryData::PostResults(posts) => Ok(posts),
            _ => Err(shape_error(&key)),
        }
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSearchResult>> {
        let key = QueryKey::SearchUsers(query.trim().to_string());
        match self.load(key.clone()).await? {
            QueryData::UserResults(users) => Ok(users),
            _ => Err(shape_error(&key)),
        }
    }

    /// First cached copy of post `id`.
    pub fn cached_post(&self, id: &PostId) -> Option<Post> {
        self.cache()
            .resolve(&post_scopes())
            .iter()
            .filter_map(|key| self.cache().get(key))
            .find_map(|data| data.find_post(id).cloned())
    }

    /// Like or unlike post `id`, whichever the cached state calls for.
    pub async fn toggle_like(&self, id: &PostId) -> Result<()> {
        reject_temporary(id)?;
        let liked = self
            .cached_post(id)
            .map_or(false, |post| post.liked_by_viewer);

        let label = if liked { "unlike post" } else { "like post" };
        let mutation = touching_posts(Mutation::new(label, on_post(id.clone(), Post::toggle_like)))
            .error_message("Failed to update like");

        let invoke = async {
            if liked {
                self.api.unlike(id).await
            } else {
                self.api.like(id).await
            }
        };
        self.executor.execute(mutation, invoke).await
    }

    pub async fn repost(&self, id: &PostId) -> Result<()> {
        reject_temporary(id)?;
        let mutation = touching_posts(Mutation::new("repost", on_post(id.clone(), Post::record_repost)));
        self.executor.execute(mutation, self.api.repost(id)).await
    }

    /// Publish a post or reply. It shows up in the cache at once under a
    /// temporary id, which the server's post replaces on success.
    pub async fn create_post(&self, post: CreatePost) -> Result<Post> {
        post.validate()?;
        if let Some(ref parent) = post.parent_id {
            reject_temporary(parent)?;
        }

        let temp = Post {
            id: PostId::temporary(),
            content: post.content.clone(),
            author: self.session.author(),
            like_count: 0,
            liked_by_viewer: false,
            repost_count: 0,
            reply_count: 0,
            created_at: Utc::now(),
            edited_at: None,
            edit_count: None,
            media_url: post.media_url.as_ref().map(Url::to_string),
            parent_id: post.parent_id.clone(),
        };
        let temp_id = temp.id.clone();

        let mutation = match post.parent_id {
            None => self.new_post_mutation(temp),
            Some(ref parent) => Self::reply_mutation(parent.clone(), temp),
        };
        let mutation = mutation
            .reconcile_with(move |current: Option<&QueryData>, created: &Post| {
                current.cloned().map(|mut data| {
                    data.replace_post(&temp_id, created);
                    data
                })
            })
            .invalidating(QueryScope::AllFeeds)
            .invalidating(QueryKey::TrendingHashtags)
            .error_message("Failed to create post");

        self.executor.execute(mutation, self.api.create_post(&post)).await
    }

    fn new_post_mutation(&self, temp: Post) -> Mutation<Post> {
        let mut keys = vec![QueryKey::home_feed()];
        for tag in extract_hashtags(&temp.content) {
            keys.push(QueryKey::Feed(FeedQuery::hashtag(&tag)));
        }
        keys.push(QueryKey::Feed(FeedQuery::author(
            self.session.handle().clone(),
            ProfileTab::Posts,
        )));

        let mut mutation = Mutation::new("create post", move |old: Option<&QueryData>| {
            let mut feed = old.and_then(QueryData::as_feed).cloned().unwrap_or_default();
            feed.prepend(temp.clone());
            Some(QueryData::Feed(feed))
        });
        for (i, key) in keys.into_iter().enumerate() {
            // The home feed always shows the new post; other feeds only when cached.
            if i == 0 || self.cache().contains(&key) {
                mutation = mutation.affecting(key);
            }
        }
        mutation
    }

    fn reply_mutation(parent: PostId, temp: Post) -> Mutation<Post> {
        let mutation = Mutation::new("reply", move |old: Option<&QueryData>| {
            old.cloned().map(|mut data| {
                data.update_post(&parent, |post| post.reply_count += 1);
                if let QueryData::Thread(ref mut thread) = data {
                    if thread.post.id == parent {
                        thread.replies.push(temp.clone());
                    }
                }
                data
            })
        });
        touching_posts(mutation)
    }

    pub async fn edit_post(&self, id: &PostId, content: &str) -> Result<()> {
        reject_temporary(id)?;
        validate_content(content)?;

        let edited = content.to_string();
        let at = Utc::now();
        let mutation = touching_posts(Mutation::new(
            "edit post",
            on_post(id.clone(), move |post| post.apply_edit(&edited, at)),
        ));
        self.executor
            .execute(mutation, self.api.edit_post(id, content))
            .await
    }

    pub async fn delete_post(&self, id: &PostId) -> Result<()> {
        reject_temporary(id)?;
        let target = id.clone();
        let mutation = touching_posts(Mutation::new(
            "delete post",
            move |old: Option<&QueryData>| {
                old.cloned().map(|mut data| {
                    data.remove_post(&target);
                    data
                })
            },
        ))
        .invalidating(QueryKey::Thread(id.clone()));
        self.executor.execute(mutation, self.api.delete_post(id)).await
    }

    /// Follow or unfollow the user behind `handle`, loading the profile
    /// first when it is not cached.
    pub async fn toggle_follow(&self, handle: &Handle) -> Result<()> {
        let profile = self.profile(handle).await?;
        let following = profile.is_followed_by_viewer;

        let label = if following { "unfollow user" } else { "follow user" };
        let mutation = Mutation::new(label, |old: Option<&QueryData>| {
            old.cloned().map(|mut data| {
                if let QueryData::Profile(ref mut profile) = data {
                    profile.toggle_follow();
                }
                data
            })
        })
        .affecting(QueryKey::Profile(handle.clone()))
        .invalidating(QueryKey::home_feed())
        .error_message("Failed to update follow");

        let invoke = async {
            if following {
                self.api.unfollow(&profile.id).await
            } else {
                self.api.follow(&profile.id).await
            }
        };
        self.executor.execute(mutation, invoke).await
    }

    /// Update the viewer's own profile.
    pub async fn update_profile(&self, update: UpdateProfile) -> Result<()> {
        update.validate()?;

        let applied = update.clone();
        let mutation = Mutation::new("update profile", move |old: Option<&QueryData>| {
            old.cloned().map(|mut data| {
                if let QueryData::Profile(ref mut profile) = data {
                    profile.apply_update(&applied);
                }
                data
            })
        })
        .affecting(QueryKey::Profile(self.session.handle().clone()))
        .invalidating(QueryScope::AllFeeds);

        self.executor
            .execute(mutation, self.api.update_profile(&update))
            .await
    }

    pub async fn mark_notifications_read(&self) -> Result<()> {
        let mutation = Mutation::new("mark notifications read", |_: Option<&QueryData>| {
            Some(QueryData::UnreadCount(0))
        })
        .affecting(QueryKey::UnreadCount)
        .invalidating(QueryScope::AllNotifications);
        self.executor
            .execute(mutation, self.api.mark_notifications_read())
            .await
    }

    /// Upload an image for a post and return its public URL.
    pub async fn upload_media(&self, content_type: &str, bytes: Vec<u8>) -> Result<Url> {
        self.api.upload_media(content_type, bytes).await
    }
}
