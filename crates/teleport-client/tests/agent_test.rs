use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use teleport_auth::{AuthError, AuthGateway, Credentials, SignIn, SubscriptionTier, TierTable};
use teleport_client::{AgentConfig, AgentError, TunnelAgent};
use teleport_control::{ControlHandler, SubdomainAllocator};
use teleport_router::{PublicConnection, RouteRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct StaticAuth;

#[async_trait]
impl AuthGateway for StaticAuth {
    async fn sign_in(&self, credentials: &Credentials) -> Result<SignIn, AuthError> {
        if credentials.password != "secret" {
            return Err(AuthError::Rejected { status: 401 });
        }
        Ok(SignIn {
            user_name: credentials.username.clone(),
            access_token: String::new(),
            tier: SubscriptionTier::Moderate,
        })
    }
}

/// Control endpoint on loopback backed by a real handler
async fn start_control(encryption: bool) -> (u16, Arc<RouteRegistry>, CancellationToken) {
    let routes = Arc::new(RouteRegistry::new());
    let allocator = Arc::new(SubdomainAllocator::new(
        routes.clone(),
        "teleport",
        "localhost",
        8080,
    ));
    let handler = Arc::new(
        ControlHandler::new(Arc::new(StaticAuth), allocator, TierTable::default())
            .with_encryption(encryption),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => accepted.unwrap(),
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let _ = handler.handle_connection(socket, Some(peer_addr)).await;
            });
        }
    });

    (port, routes, shutdown)
}

/// Local TCP service that upper-cases whatever it receives
async fn start_local_service() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    buf[..n].make_ascii_uppercase();
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn agent_config(port: u16, local_addr: &str) -> AgentConfig {
    AgentConfig {
        server_host: "127.0.0.1".to_string(),
        server_port: port,
        username: "agent".to_string(),
        password: "secret".to_string(),
        local_addr: local_addr.to_string(),
        connect_timeout: Duration::from_secs(5),
        ..AgentConfig::default()
    }
}

fn dispatch_public(routes: &RouteRegistry, host: &str) -> tokio::io::DuplexStream {
    let (user, server_end) = tokio::io::duplex(16 * 1024);
    routes
        .dispatch(host, PublicConnection::new(server_end, None, Bytes::new()))
        .unwrap();
    user
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_forwards_to_local_service() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let (port, routes, _server) = start_control(true).await;
    let local_addr = start_local_service().await;

    let connected = TunnelAgent::new(agent_config(port, &local_addr))
        .connect()
        .await
        .unwrap();
    assert!(connected.is_encrypted());
    let public_host = connected.public_host().to_string();
    assert!(public_host.starts_with("teleport-agent-"));

    let shutdown = CancellationToken::new();
    let agent_task = tokio::spawn(connected.run(shutdown.clone()));

    for _ in 0..3 {
        let mut user = dispatch_public(&routes, &public_host);
        user.write_all(b"hello tunnel").await.unwrap();
        let mut reply = [0u8; 12];
        tokio::time::timeout(Duration::from_secs(5), user.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"HELLO TUNNEL");
    }

    shutdown.cancel();
    agent_task.await.unwrap().unwrap();

    // The server notices the closed session and releases the route.
    for _ in 0..200 {
        if routes.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(routes.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_plaintext_mode() {
    let (port, routes, _server) = start_control(false).await;
    let local_addr = start_local_service().await;

    let config = AgentConfig {
        encryption: false,
        ..agent_config(port, &local_addr)
    };
    let connected = TunnelAgent::new(config).connect().await.unwrap();
    assert!(!connected.is_encrypted());
    let public_host = connected.public_host().to_string();
    tokio::spawn(connected.run(CancellationToken::new()));

    let mut user = dispatch_public(&routes, &public_host);
    user.write_all(b"abc").await.unwrap();
    let mut reply = [0u8; 3];
    user.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ABC");
}

#[tokio::test]
async fn test_wrong_password() {
    let (port, routes, _server) = start_control(true).await;
    let config = AgentConfig {
        password: "nope".to_string(),
        ..agent_config(port, "127.0.0.1:1")
    };

    let err = TunnelAgent::new(config).connect().await.unwrap_err();
    assert!(matches!(err, AgentError::AuthenticationFailed(_)), "{}", err);
    assert!(routes.is_empty());
}

#[tokio::test]
async fn test_plaintext_agent_rejected_by_encrypted_server() {
    let (port, routes, _server) = start_control(true).await;
    let config = AgentConfig {
        encryption: false,
        ..agent_config(port, "127.0.0.1:1")
    };

    let err = TunnelAgent::new(config).connect().await.unwrap_err();
    assert!(
        matches!(err, AgentError::Rejected { status: 400, .. }),
        "{}",
        err
    );
    assert!(routes.is_empty());
}

#[tokio::test]
async fn test_encrypted_agent_against_plaintext_server() {
    let (port, _routes, _server) = start_control(false).await;

    let err = TunnelAgent::new(agent_config(port, "127.0.0.1:1"))
        .connect()
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::KeyExchange(_)), "{}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_local_service_closes_public_connection() {
    let (port, routes, _server) = start_control(true).await;

    // Bind and drop to get a port nothing listens on.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap().to_string();
    drop(unused);

    let connected = TunnelAgent::new(agent_config(port, &dead_addr))
        .connect()
        .await
        .unwrap();
    let public_host = connected.public_host().to_string();
    tokio::spawn(connected.run(CancellationToken::new()));

    let mut user = dispatch_public(&routes, &public_host);
    user.write_all(b"anyone there?").await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), user.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}
