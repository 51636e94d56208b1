//! Identity/session bridge.
//!
//! Turns the identity provider's sign-in result (an id token plus the
//! provider's view of the account) into a server session and a local
//! [`SessionUser`]. The provider's own sign-in flows live outside this crate.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::client::{Client, Error, LoginResponse, Result, SessionToken, UnauthenticatedClient};
use crate::post::Author;
use crate::user::{Handle, ProviderUid, Registration, Role, SessionUser, UserId};

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Short-lived token issued by the identity provider.
#[derive(Clone)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn new(token: &str) -> Self {
        IdentityToken(token.to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IdentityToken(..)")
    }
}

/// What the identity provider knows about the signed-in account.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderIdentity {
    pub uid: ProviderUid,
    pub email: Option<String>,
    pub email_verified: bool,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionResult {
    pub role: Role,
    pub profile: SessionUser,
    session_token: SessionToken,
}

impl SessionResult {
    pub fn session_token(&self) -> &SessionToken {
        &self.session_token
    }
}

/// The signed-in user, passed explicitly to everything that acts on the
/// viewer's behalf.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    user: SessionUser,
}

impl SessionContext {
    pub fn new(user: SessionUser) -> Self {
        SessionContext { user }
    }

    pub fn user(&self) -> &SessionUser {
        &self.user
    }

    pub fn handle(&self) -> &Handle {
        &self.user.handle
    }

    /// Author snapshot for posts the viewer writes.
    pub fn author(&self) -> Author {
        let id = match self.user.user_id {
            Some(ref id) => id.clone(),
            None => UserId::from(self.user.uid.as_str()),
        };
        Author {
            id,
            display_name: self
                .user
                .display_name
                .clone()
                .unwrap_or_else(|| self.user.handle.as_str().to_string()),
            handle: self.user.handle.clone(),
            avatar_url: self.user.avatar_url.clone(),
        }
    }
}

/// The single client-local slot holding the last signed-in user.
pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> Result<Option<SessionUser>>;
    fn save(&self, user: &SessionUser) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Keeps the snapshot as JSON in one file.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileSnapshotStore { path: path.into() }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<SessionUser>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(user) => Ok(Some(user)),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring unreadable user snapshot");
                Ok(None)
            }
        }
    }

    fn save(&self, user: &SessionUser) -> Result<()> {
        let json = serde_json::to_vec_pretty(user)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    user: Mutex<Option<SessionUser>>,
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<SessionUser>> {
        Ok(self.user.lock().ok().and_then(|user| user.clone()))
    }

    fn save(&self, user: &SessionUser) -> Result<()> {
        if let Ok(mut slot) = self.user.lock() {
            *slot = Some(user.clone());
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if let Ok(mut slot) = self.user.lock() {
            *slot = None;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct RegisterUser<'a> {
    firebase_uid: &'a str,
    email: &'a str,
    username: &'a str,
    display_name: &'a str,
    avatar_url: Option<&'a str>,
    email_verified: bool,
}

fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::ProfileNotFound) || err.status() == Some(404)
}

pub struct SessionBridge {
    client: UnauthenticatedClient,
    snapshots: Arc<dyn SnapshotStore>,
}

impl fmt::Debug for SessionBridge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SessionBridge({:?})", self.client)
    }
}

impl SessionBridge {
    pub fn new(client: UnauthenticatedClient, snapshots: Arc<dyn SnapshotStore>) -> Self {
        SessionBridge { client, snapshots }
    }

    /// The user persisted by the last successful sign-in, if any.
    pub fn last_user(&self) -> Result<Option<SessionUser>> {
        self.snapshots.load()
    }

    /// Sign in and hand back the authenticated client.
    ///
    /// Consumes the bridge. Use [`login`](Self::login) first when an
    /// unregistered account must be able to continue with
    /// [`register`](Self::register).
    pub async fn establish_session(
        self,
        token: &IdentityToken,
        identity: &ProviderIdentity,
    ) -> Result<(Client, SessionResult)> {
        let result = self.login(token, identity).await?;
        Ok((self.into_client(&result), result))
    }

    /// Exchange `token` for a server session and merge the account record.
    ///
    /// Fails with [`Error::Auth`] when the token is rejected and with
    /// [`Error::ProfileNotFound`] when the account has not registered yet.
    pub async fn login(
        &self,
        token: &IdentityToken,
        identity: &ProviderIdentity,
    ) -> Result<SessionResult> {
        if token.as_str().is_empty() {
            return Err(Error::Auth("identity token is empty".to_string()));
        }

        let (session_token, login) = match self.client.login(token.as_str()).await {
            Ok(login) => login,
            Err(err) if is_not_found(&err) => return Err(Error::ProfileNotFound),
            Err(err) => return Err(err),
        };
        let result = merge_profile(session_token, login, identity)?;

        self.snapshots.save(&result.profile)?;
        info!(handle = %result.profile.handle, role = ?result.role, "session established");
        Ok(result)
    }

    /// Register an authenticated account with the backend and sign it in.
    pub async fn register(
        &self,
        token: &IdentityToken,
        identity: &ProviderIdentity,
        registration: &Registration,
        today: NaiveDate,
    ) -> Result<SessionResult> {
        registration.validate(today)?;

        let session = match self.client.login(token.as_str()).await {
            Ok((session, _)) => Some(session),
            Err(err) if is_not_found(&err) => None,
            Err(err) => return Err(err),
        };

        let body = RegisterUser {
            firebase_uid: identity.uid.as_str(),
            email: registration.email.as_str(),
            username: registration.username.as_str(),
            display_name: registration.display_name.as_str(),
            avatar_url: registration
                .avatar_url
                .as_deref()
                .or(identity.photo_url.as_deref()),
            email_verified: identity.email_verified,
        };
        let registered = self.client.register(session.as_ref(), &body).await?;

        let session_token = match session {
            Some(session) => session,
            None => self.client.login(token.as_str()).await?.0,
        };

        let role = registered.role.unwrap_or_default();
        let profile = match registered.user {
            Some(user) => SessionUser {
                uid: identity.uid.clone(),
                user_id: Some(user.id.clone()),
                role,
                handle: user.handle.clone(),
                display_name: user.display_name.clone(),
                avatar_url: user.avatar_url.clone(),
                email: identity.email.clone(),
                email_verified: identity.email_verified,
            },
            None => SessionUser {
                uid: identity.uid.clone(),
                user_id: None,
                role,
                handle: Handle::new(&registration.username),
                display_name: Some(registration.display_name.clone()),
                avatar_url: body.avatar_url.map(str::to_string),
                email: Some(registration.email.clone()),
                email_verified: identity.email_verified,
            },
        };

        self.snapshots.save(&profile)?;
        info!(handle = %profile.handle, "account registered");
        Ok(SessionResult {
            role,
            profile,
            session_token,
        })
    }

    /// Finish sign-in: an authenticated client for the established session.
    pub fn into_client(self, result: &SessionResult) -> Client {
        self.client
            .into_client(result.session_token.clone(), result.profile.uid.clone())
    }
}

/// Server fields (role, handle, avatar) win; the provider supplies the
/// verified email and fills gaps.
fn merge_profile(
    session_token: SessionToken,
    login: LoginResponse,
    identity: &ProviderIdentity,
) -> Result<SessionResult> {
    let user = login.user.ok_or(Error::ProfileNotFound)?;
    let role = login.role.unwrap_or_default();
    let profile = SessionUser {
        uid: identity.uid.clone(),
        user_id: Some(user.id),
        role,
        handle: user.handle,
        display_name: user.display_name.or_else(|| identity.display_name.clone()),
        avatar_url: user.avatar_url.or_else(|| identity.photo_url.clone()),
        email: identity.email.clone(),
        email_verified: identity.email_verified,
    };
    Ok(SessionResult {
        role,
        profile,
        session_token,
    })
}

/// End the server session and forget the persisted user.
pub async fn sign_out(client: Client, snapshots: &dyn SnapshotStore) -> Result<UnauthenticatedClient> {
    let result = client.logout().await;
    snapshots.clear()?;
    result
}
