pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod mutation;
pub mod notification;
pub mod post;
pub mod query;
pub mod search;
pub mod session;
pub mod store;
pub mod user;

pub use crate::api::SocialApi;
pub use crate::client::Client;
pub use crate::client::Error;
pub use crate::client::UnauthenticatedClient;
pub use crate::config::Config;
pub use crate::mutation::{LogNotifier, Notifier};
pub use crate::session::{SessionBridge, SessionContext};
pub use crate::store::Store;
