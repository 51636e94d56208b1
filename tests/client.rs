use std::convert::Infallible;
use std::sync::Arc;

use chrono::NaiveDate;
use hyper::header::{COOKIE, SET_COOKIE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use url::Url;

use westwind::client::ErrorKind;
use westwind::mutation::RecordingNotifier;
use westwind::post::PostId;
use westwind::query::{FeedQuery, QueryKey};
use westwind::session::{
    IdentityToken, MemorySnapshotStore, ProviderIdentity, SnapshotStore,
};
use westwind::user::{ProviderUid, Registration};
use westwind::{
    Error, SessionBridge, SessionContext, SocialApi, Store, UnauthenticatedClient,
};

const COOKIE_VALUE: &str = "session=abc123";

fn reply(status: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_json(id: &str) -> Value {
    json!({
        "id": id,
        "content": "hello #world",
        "timestamp": "2024-05-01T12:00:00Z",
        "likes": 3,
        "likedByViewer": false,
        "author": {"id": "u1", "name": "Alice", "handle": "@alice"}
    })
}

async fn body_json(req: Request<Body>) -> Value {
    let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let authed = req
        .headers()
        .get(COOKIE)
        .map_or(false, |value| value == COOKIE_VALUE);

    let response = match (method, path.as_str()) {
        (Method::POST, "/api/auth/login") => {
            let body = body_json(req).await;
            match body["idToken"].as_str() {
                Some("good") | Some("unregistered") => {
                    let user = if body["idToken"] == "good" {
                        json!({"id": 1, "username": "ada", "display_name": null, "avatar_url": "https://cdn/ada.png"})
                    } else {
                        Value::Null
                    };
                    Response::builder()
                        .header(SET_COOKIE, format!("{}; Path=/; HttpOnly", COOKIE_VALUE))
                        .body(Body::from(json!({"role": "ADMIN", "user": user}).to_string()))
                        .unwrap()
                }
                Some("missing") => reply(StatusCode::NOT_FOUND, json!({"message": "no user"})),
                _ => reply(StatusCode::UNAUTHORIZED, json!({"message": "invalid token"})),
            }
        }
        (Method::POST, "/api/users") if authed => {
            let body = body_json(req).await;
            if body["username"] == "ada_l" && body["firebase_uid"] == "uid-ada" {
                reply(StatusCode::OK, json!({"role": "USER"}))
            } else {
                reply(StatusCode::BAD_REQUEST, json!({"message": "bad registration"}))
            }
        }
        (Method::GET, "/api/posts") if authed => {
            let query = req.uri().query().unwrap_or("").to_string();
            if query.contains("firebase_uid=uid-ada") {
                reply(
                    StatusCode::OK,
                    json!({"posts": [post_json("p1"), post_json("p2")], "nextCursor": 2}),
                )
            } else {
                reply(StatusCode::BAD_REQUEST, json!({"message": "missing uid"}))
            }
        }
        (Method::POST, "/api/likes") if authed => {
            let body = body_json(req).await;
            if body["post_id"] == "p1" && body["firebase_uid"] == "uid-ada" {
                reply(StatusCode::OK, json!({}))
            } else {
                reply(StatusCode::INTERNAL_SERVER_ERROR, json!({"message": "like failed"}))
            }
        }
        (Method::POST, "/api/auth/logout") if authed => reply(StatusCode::OK, json!({})),
        (Method::GET, "/api/search/posts") if authed => {
            reply(StatusCode::OK, json!([post_json("temp-1")]))
        }
        (_, path) if path.starts_with("/api/") && !authed => {
            reply(StatusCode::UNAUTHORIZED, json!({"message": "no session"}))
        }
        _ => reply(StatusCode::NOT_FOUND, json!({"message": "not found"})),
    };
    Ok(response)
}

async fn spawn_server() -> Url {
    let make = make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make);
    let addr = server.local_addr();
    tokio::spawn(server);
    format!("http://{}/api", addr).parse().unwrap()
}

fn identity() -> ProviderIdentity {
    ProviderIdentity {
        uid: ProviderUid::from("uid-ada"),
        email: Some("ada@example.com".to_string()),
        email_verified: true,
        display_name: Some("Ada Lovelace".to_string()),
        photo_url: None,
    }
}

async fn bridge() -> (SessionBridge, Arc<MemorySnapshotStore>) {
    let url = spawn_server().await;
    let snapshots = Arc::new(MemorySnapshotStore::default());
    let client = UnauthenticatedClient::new_insecure(url).unwrap();
    (SessionBridge::new(client, snapshots.clone()), snapshots)
}

#[tokio::test]
async fn sign_in_fetch_feed_and_like() {
    let (bridge, snapshots) = bridge().await;
    let (client, session) = bridge
        .establish_session(&IdentityToken::new("good"), &identity())
        .await
        .unwrap();

    assert_eq!(session.profile.handle.as_str(), "ada");
    assert_eq!(session.profile.display_name.as_deref(), Some("Ada Lovelace"));
    assert_eq!(session.profile.avatar_url.as_deref(), Some("https://cdn/ada.png"));
    assert_eq!(session.session_token().as_str(), COOKIE_VALUE);
    assert_eq!(snapshots.load().unwrap(), Some(session.profile.clone()));

    let notifier = Arc::new(RecordingNotifier::default());
    let store = Store::new(
        Arc::new(client),
        SessionContext::new(session.profile),
        notifier.clone(),
    );
    let feed = store.feed(&FeedQuery::home()).await.unwrap();
    assert_eq!(feed.posts().count(), 2);
    assert!(feed.has_more());

    store.toggle_like(&PostId::from("p1")).await.unwrap();
    let cached = store.cache().get(&QueryKey::home_feed()).unwrap();
    let liked = cached.find_post(&PostId::from("p1")).unwrap();
    assert_eq!((liked.like_count, liked.liked_by_viewer), (4, true));
    assert!(notifier.notices().is_empty());
}

#[tokio::test]
async fn rejected_token_is_an_auth_error() {
    let (bridge, snapshots) = bridge().await;
    let err = bridge
        .login(&IdentityToken::new("expired"), &identity())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(snapshots.load().unwrap(), None);
}

#[tokio::test]
async fn unregistered_accounts_can_register() {
    let (bridge, _) = bridge().await;
    for token in ["missing", "unregistered"] {
        let err = bridge
            .login(&IdentityToken::new(token), &identity())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProfileNotFound), "{}: {:?}", token, err);
    }

    let registration = Registration {
        email: "ada@example.com".to_string(),
        username: "ada_l".to_string(),
        display_name: "Ada".to_string(),
        date_of_birth: NaiveDate::from_ymd_opt(1990, 12, 10).unwrap(),
        accepted_terms: true,
        avatar_url: None,
    };
    let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    let session = bridge
        .register(&IdentityToken::new("unregistered"), &identity(), &registration, today)
        .await
        .unwrap();
    assert_eq!(session.profile.handle.as_str(), "ada_l");
    assert_eq!(session.role, westwind::user::Role::User);

    let client = bridge.into_client(&session);
    assert_eq!(client.viewer().as_str(), "uid-ada");
}

#[tokio::test]
async fn reserved_ids_in_server_payloads_are_parse_errors() {
    let (bridge, _) = bridge().await;
    let (client, _) = bridge
        .establish_session(&IdentityToken::new("good"), &identity())
        .await
        .unwrap();

    let err = client.search_posts("hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    assert!(client.search_posts("   ").await.unwrap().is_empty());
}

#[tokio::test]
async fn sign_out_clears_snapshot_and_session() {
    let (bridge, snapshots) = bridge().await;
    let (client, _) = bridge
        .establish_session(&IdentityToken::new("good"), &identity())
        .await
        .unwrap();
    assert!(snapshots.load().unwrap().is_some());

    let client = westwind::session::sign_out(client, snapshots.as_ref())
        .await
        .unwrap();
    assert_eq!(snapshots.load().unwrap(), None);

    let err = client
        .login("expired")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
}
