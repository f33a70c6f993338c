//! Tunnel client against a live relay.

mod common;

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use tunnel_relay::client::{Tunnel, TunnelEvent, TunnelOptions};

use common::*;

async fn wait_for_url(events: &mut UnboundedReceiver<TunnelEvent>) -> String {
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(TunnelEvent::Url(url)) => return url,
            Some(TunnelEvent::Error(err)) => panic!("tunnel failed: {err}"),
            Some(_) => continue,
            None => panic!("tunnel events ended"),
        }
    }
}

async fn wait_for_closed(events: &mut UnboundedReceiver<TunnelEvent>) {
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(TunnelEvent::Closed) | None => return,
            Some(_) => continue,
        }
    }
}

async fn get_through(relay: &TestRelay, host: &str, path: &str) -> String {
    http_client()
        .get(relay.url(path))
        .header("host", host)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}

#[tokio::test]
async fn exposes_local_service() {
    let relay = start_relay().await;
    let local = start_echo_service().await;

    let (tunnel, mut events) = Tunnel::open(TunnelOptions {
        port: local.port(),
        host: relay.url(""),
        subdomain: Some("e2e-plain".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(tunnel.client_id(), "e2e-plain");

    let url = wait_for_url(&mut events).await;
    assert!(url.starts_with("http://e2e-plain."), "{url}");
    wait_for_sockets(&relay, "e2e-plain", 10).await;

    let body = get_through(&relay, "e2e-plain.example.com", "/status?check=1").await;
    assert_eq!(body, "host=e2e-plain.example.com path=/status?check=1");

    tunnel.close();
    wait_for_closed(&mut events).await;
    relay.stop();
}

#[tokio::test]
async fn local_host_rewrites_host_header() {
    let relay = start_relay().await;
    let local = start_echo_service().await;

    let (tunnel, mut events) = Tunnel::open(TunnelOptions {
        port: local.port(),
        host: relay.url(""),
        subdomain: Some("e2e-rewrite".to_string()),
        local_host: Some("127.0.0.1".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    wait_for_url(&mut events).await;
    wait_for_sockets(&relay, "e2e-rewrite", 1).await;

    let body = get_through(&relay, "e2e-rewrite.example.com", "/").await;
    assert_eq!(body, "host=127.0.0.1 path=/");

    tunnel.close();
    wait_for_closed(&mut events).await;
    relay.stop();
}

#[tokio::test]
async fn requests_are_reported() {
    let relay = start_relay().await;
    let local = start_echo_service().await;

    let (tunnel, mut events) = Tunnel::open(TunnelOptions {
        port: local.port(),
        host: relay.url(""),
        subdomain: Some("e2e-events".to_string()),
        local_host: Some("127.0.0.1".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    wait_for_url(&mut events).await;
    wait_for_sockets(&relay, "e2e-events", 1).await;

    get_through(&relay, "e2e-events.example.com", "/report-me").await;

    let request = loop {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(TunnelEvent::Request(request)) => break request,
            Some(_) => continue,
            None => panic!("tunnel events ended"),
        }
    };
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/report-me");

    tunnel.close();
    relay.stop();
}

#[tokio::test]
async fn taken_subdomain_gets_a_random_id() {
    let relay = start_relay().await;
    create_session(&relay, "e2e-taken").await;
    let local = start_echo_service().await;

    let (tunnel, _events) = Tunnel::open(TunnelOptions {
        port: local.port(),
        host: relay.url(""),
        subdomain: Some("e2e-taken".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    assert_ne!(tunnel.client_id(), "e2e-taken");
    assert!(relay.manager.has_client(tunnel.client_id()));

    tunnel.close();
    relay.stop();
}

#[tokio::test]
async fn invalid_subdomain_is_a_server_error() {
    let relay = start_relay().await;
    let result = Tunnel::open(TunnelOptions {
        port: 1,
        host: relay.url(""),
        subdomain: Some("UPPER".to_string()),
        ..Default::default()
    })
    .await;
    match result {
        Err(tunnel_relay::client::TunnelError::Server(message)) => {
            assert!(message.starts_with("Invalid subdomain"), "{message}")
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("tunnel opened with an invalid subdomain"),
    }
    relay.stop();
}
