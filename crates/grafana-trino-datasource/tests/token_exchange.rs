use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use grafana_trino::{
    token::{ClientCredentials, TokenCache, TokenSource},
    TokenError,
};
use httpmock::prelude::*;
use pretty_assertions::assert_eq;
use serde_json::json;

fn credentials(server: &MockServer) -> ClientCredentials {
    ClientCredentials::new(
        reqwest::Client::new(),
        server.url("/oauth2/token"),
        "grafana",
        "s3cr3t",
    )
}

#[tokio::test]
async fn exchanges_client_credentials() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/oauth2/token")
                .form_urlencoded_tuple("grant_type", "client_credentials")
                .form_urlencoded_tuple("client_id", "grafana")
                .form_urlencoded_tuple("client_secret", "s3cr3t");
            then.status(200)
                .json_body(json!({"access_token": "abc", "expires_in": 3600, "token_type": "Bearer"}));
        })
        .await;

    let token = credentials(&server).fetch_token().await.unwrap();
    assert_eq!(token.access_token(), "abc");
    assert!(token.is_usable());
    mock.assert_async().await;
}

#[tokio::test]
async fn non_200_is_an_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(401).body("unauthorized_client");
        })
        .await;

    let err = credentials(&server).fetch_token().await.unwrap_err();
    assert!(matches!(err, TokenError::Status(s) if s.as_u16() == 401));
}

#[tokio::test]
async fn undecodable_response_is_an_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).body("<html>login</html>");
        })
        .await;

    let err = credentials(&server).fetch_token().await.unwrap_err();
    assert!(matches!(err, TokenError::Decode(_)));
}

#[tokio::test]
async fn failed_refresh_keeps_cached_token() {
    let server = MockServer::start_async().await;
    // Expires inside the safety margin, so every call tries to refresh it.
    let mut ok = server
        .mock_async(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200)
                .json_body(json!({"access_token": "short-lived", "expires_in": "30"}));
        })
        .await;

    let cache = TokenCache::new(credentials(&server));
    let first = cache.token().await.unwrap();
    assert_eq!(first.access_token(), "short-lived");
    ok.delete_async().await;

    let failing = server
        .mock_async(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(500);
        })
        .await;
    let err = cache.token().await.unwrap_err();
    assert!(matches!(err, TokenError::Status(s) if s.as_u16() == 500));
    assert!(Arc::ptr_eq(&cache.cached().unwrap(), &first));
    failing.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_exchange() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200)
                .delay(Duration::from_millis(200))
                .json_body(json!({"access_token": "shared", "expires_in": 3600}));
        })
        .await;

    let cache = Arc::new(TokenCache::new(credentials(&server)));
    let tokens = join_all((0..16).map(|_| {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.token().await })
    }))
    .await;
    for token in tokens {
        assert_eq!(token.unwrap().unwrap().access_token(), "shared");
    }
    mock.assert_hits_async(1).await;
}
