use std::sync::Arc;

use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use westwind::config::required_var;
use westwind::post::Feed;
use westwind::query::FeedQuery;
use westwind::session::{FileSnapshotStore, IdentityToken, ProviderIdentity, SnapshotStore};
use westwind::user::ProviderUid;
use westwind::{Config, Error, LogNotifier, SessionBridge, SessionContext, Store};

fn print_feed(feed: &Feed) {
    for post in feed.posts() {
        println!(
            "{} {} ({} likes, {} replies)\n    {}",
            post.author.handle,
            post.created_at.format("%Y-%m-%d %H:%M"),
            post.like_count,
            post.reply_count,
            post.content
        );
    }
    if feed.has_more() {
        println!("...");
    }
}

async fn run(config: Config) -> Result<(), Error> {
    let token = required_var("WESTWIND_ID_TOKEN")?;
    let uid = required_var("WESTWIND_UID")?;

    let snapshots: Arc<dyn SnapshotStore> =
        Arc::new(FileSnapshotStore::new(config.snapshot_path.clone()));
    if let Some(user) = snapshots.load()? {
        info!(handle = %user.handle, "last signed in user");
    }

    let identity = ProviderIdentity {
        uid: ProviderUid::from(uid.as_str()),
        email: None,
        email_verified: false,
        display_name: None,
        photo_url: None,
    };
    let bridge = SessionBridge::new(config.client()?, snapshots);
    let (client, session) = bridge
        .establish_session(&IdentityToken::new(&token), &identity)
        .await?;
    info!(handle = %session.profile.handle, role = ?session.role, "signed in");

    let store = Store::new(
        Arc::new(client),
        SessionContext::new(session.profile),
        Arc::new(LogNotifier),
    );
    let feed = store.feed(&FeedQuery::home()).await?;
    print_feed(&feed);
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let result = match Config::from_env() {
        Ok(config) => run(config).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        error!(kind = ?err.kind(), "{}", err);
        std::process::exit(1);
    }
}
