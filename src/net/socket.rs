//! TCP socket helpers shared by the relay and the tunnel client.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Enable TCP keep-alive on a long-lived tunnel connection.
pub fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(20));

    #[cfg(target_os = "linux")]
    let keepalive = keepalive.with_retries(3);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Resolves once the peer closed a connection nobody is reading yet.
///
/// Peeks without consuming. If the peer sends data instead, the bytes are
/// left for whoever consumes the stream and this never resolves.
pub async fn closed_while_idle(stream: &TcpStream) {
    let mut buf = [0u8; 1];
    match stream.peek(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending::<()>().await,
    }
}

/// Local dial errors worth retrying: the service is not up yet or restarted.
pub fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn detects_peer_close() {
        let (client, server) = pair().await;
        drop(client);
        tokio::time::timeout(Duration::from_secs(2), closed_while_idle(&server))
            .await
            .expect("close should be detected");
    }

    #[tokio::test]
    async fn pending_data_is_not_a_close() {
        let (mut client, server) = pair().await;
        client.write_all(b"GET").await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(200), closed_while_idle(&server)).await;
        assert!(waited.is_err());

        let mut buf = [0u8; 3];
        server.peek(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET");
    }

    #[tokio::test]
    async fn keepalive_can_be_enabled() {
        let (client, _server) = pair().await;
        enable_keepalive(&client).unwrap();
        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[test]
    fn retryable_errors() {
        assert!(is_retryable(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_retryable(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_retryable(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
