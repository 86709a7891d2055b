//! Control sessions driven end to end over in-memory transports

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use teleport_auth::{
    AuthError, AuthGateway, Credentials, SignIn, SubscriptionTier, TierLimits, TierTable,
};
use teleport_connection::{MultiplexedSession, MuxSession};
use teleport_control::{AdmissionPolicy, ControlError, ControlHandler, SubdomainAllocator};
use teleport_crypto::{EphemeralKeyPair, SessionCipher};
use teleport_proto::{read_response, ControlRequest, ControlResponse};
use teleport_relay::RelayMode;
use teleport_router::{DispatchError, PublicConnection, RouteRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::info;

const PASSWORD: &str = "correct horse";

struct FakeAuth;

#[async_trait]
impl AuthGateway for FakeAuth {
    async fn sign_in(&self, credentials: &Credentials) -> Result<SignIn, AuthError> {
        if credentials.password != PASSWORD {
            return Err(AuthError::Rejected { status: 401 });
        }
        Ok(SignIn {
            user_name: credentials.username.clone(),
            access_token: "token".to_string(),
            tier: SubscriptionTier::Free,
        })
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn create_handler(
    free: TierLimits,
    policy: AdmissionPolicy,
    encryption: bool,
) -> (Arc<ControlHandler>, Arc<RouteRegistry>) {
    let routes = Arc::new(RouteRegistry::new());
    let allocator = Arc::new(SubdomainAllocator::new(
        routes.clone(),
        "teleport",
        "localhost",
        8080,
    ));
    let tiers = TierTable::new(free, TierLimits::uniform(50), TierLimits::uniform(100));
    let handler = ControlHandler::new(Arc::new(FakeAuth), allocator, tiers)
        .with_admission_policy(policy)
        .with_encryption(encryption)
        .with_drain_timeout(Duration::from_secs(1));
    (Arc::new(handler), routes)
}

fn spawn_control(
    handler: &Arc<ControlHandler>,
) -> (DuplexStream, JoinHandle<Result<(), ControlError>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let handler = handler.clone();
    let task = tokio::spawn(async move { handler.handle_connection(server, None).await });
    (client, task)
}

/// Agent side of an established session, serving an echo service
struct TestAgent {
    public_host: String,
    mux: Arc<MuxSession>,
}

async fn send_handshake(
    stream: &mut DuplexStream,
    request: &ControlRequest,
) -> (ControlResponse, BytesMut) {
    stream.write_all(&request.encode()).await.unwrap();
    let mut buf = BytesMut::new();
    let response = read_response(stream, &mut buf).await.unwrap();
    (response, buf)
}

async fn connect_agent(
    handler: &Arc<ControlHandler>,
    username: &str,
    encrypt: bool,
) -> (TestAgent, JoinHandle<Result<(), ControlError>>) {
    connect_agent_tampering(handler, username, encrypt, None).await
}

/// Like [`connect_agent`], but the `tamper`-th accepted channel (counting from 0) gets
/// a forged sealed frame instead of an echo service.
async fn connect_agent_tampering(
    handler: &Arc<ControlHandler>,
    username: &str,
    encrypt: bool,
    tamper: Option<usize>,
) -> (TestAgent, JoinHandle<Result<(), ControlError>>) {
    let (mut stream, task) = spawn_control(handler);
    let key_pair = EphemeralKeyPair::generate().unwrap();
    let request = ControlRequest {
        host: Some("localhost".to_string()),
        username: Some(username.to_string()),
        password: Some(PASSWORD.to_string()),
        client_public_key: encrypt.then(|| key_pair.public_key_hex()),
    };

    let (response, leftover) = send_handshake(&mut stream, &request).await;
    assert_eq!(response.status, 200, "{:?}", response.message);
    assert_eq!(response.server_public_key.is_some(), encrypt);

    let mode = match response.server_public_key.as_deref() {
        Some(server_key) => {
            let key = key_pair.derive_from_hex(Some(server_key)).unwrap();
            RelayMode::Encrypted(SessionCipher::new(&key).unwrap())
        }
        None => RelayMode::Plain,
    };

    let mux = Arc::new(MuxSession::client(stream, leftover));
    let serving = mux.clone();
    tokio::spawn(async move {
        let mut accepted = 0;
        while let Ok(Some(mut channel)) = serving.accept().await {
            if tamper == Some(accepted) {
                accepted += 1;
                tokio::spawn(async move {
                    // Valid length prefix, garbage nonce, ciphertext and tag.
                    let mut forged = 40u32.to_be_bytes().to_vec();
                    forged.extend_from_slice(&[0xa5; 40]);
                    let _ = channel.write_all(&forged).await;
                    let mut sink = Vec::new();
                    let _ = channel.read_to_end(&mut sink).await;
                });
                continue;
            }
            accepted += 1;

            let mode = mode.clone();
            tokio::spawn(async move {
                let (local, service) = tokio::io::duplex(64 * 1024);
                tokio::spawn(echo(service));
                let _ = mode.run(local, channel).await;
            });
        }
    });

    let agent = TestAgent {
        public_host: response.public_host.unwrap(),
        mux,
    };
    (agent, task)
}

async fn echo(service: DuplexStream) {
    let (mut read, mut write) = tokio::io::split(service);
    let _ = tokio::io::copy(&mut read, &mut write).await;
    let _ = write.shutdown().await;
}

fn open_public(routes: &RouteRegistry, host: &str) -> DuplexStream {
    let (user, server_end) = tokio::io::duplex(64 * 1024);
    routes
        .dispatch(host, PublicConnection::new(server_end, None, Bytes::new()))
        .unwrap();
    user
}

async fn roundtrip(user: &mut DuplexStream, payload: &[u8]) -> Vec<u8> {
    let (mut read, mut write) = tokio::io::split(user);
    let mut reply = vec![0u8; payload.len()];
    let (written, echoed) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(write.write_all(payload), read.read_exact(&mut reply)) },
    )
    .await
    .expect("echo timed out");
    written.unwrap();
    echoed.unwrap();
    reply
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_encrypted_session_forwards_and_cleans_up() {
    init_tracing();
    info!("TEST: encrypted session echo and cleanup");

    let (handler, routes) = create_handler(TierLimits::uniform(4), AdmissionPolicy::Stop, true);
    let (agent, task) = connect_agent(&handler, "alice", true).await;

    assert!(agent.public_host.starts_with("teleport-alice-"));
    assert!(agent.public_host.ends_with(".localhost:8080"));
    assert!(routes.contains(&agent.public_host));
    let session = handler.sessions().get("alice").unwrap();
    assert!(session.cipher.is_some());
    assert_eq!(session.tier, SubscriptionTier::Free);

    let mut user = open_public(&routes, &agent.public_host);
    assert_eq!(roundtrip(&mut user, b"GET / HTTP/1.1\r\n\r\n").await, b"GET / HTTP/1.1\r\n\r\n");

    let large: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(roundtrip(&mut user, &large).await, large);

    // One ticket is held by the accept waiting for the next public connection.
    drop(user);
    eventually(|| session.admission.active() == 1).await;

    agent.mux.close().await;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session did not end")
        .unwrap()
        .unwrap();

    assert!(handler.sessions().is_empty());
    assert!(routes.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_plain_session_forwards() {
    init_tracing();

    let (handler, routes) = create_handler(TierLimits::uniform(4), AdmissionPolicy::Stop, false);
    let (agent, task) = connect_agent(&handler, "bob", false).await;
    assert!(handler.sessions().get("bob").unwrap().cipher.is_none());

    let mut user = open_public(&routes, &agent.public_host);
    assert_eq!(roundtrip(&mut user, b"ping").await, b"ping");

    agent.mux.close().await;
    task.await.unwrap().unwrap();
    assert!(routes.is_empty());
}

#[tokio::test]
async fn test_wrong_password_is_unauthorized() {
    init_tracing();

    let (handler, routes) = create_handler(TierLimits::uniform(2), AdmissionPolicy::Stop, true);
    let (mut stream, task) = spawn_control(&handler);
    let request = ControlRequest {
        host: Some("localhost".to_string()),
        username: Some("mallory".to_string()),
        password: Some("guess".to_string()),
        client_public_key: Some(EphemeralKeyPair::generate().unwrap().public_key_hex()),
    };

    let (response, _) = send_handshake(&mut stream, &request).await;
    assert_eq!(response.status, 401);
    assert!(response.public_host.is_none());

    assert!(matches!(task.await.unwrap(), Err(ControlError::Auth(_))));
    assert!(routes.is_empty());
    assert!(handler.sessions().is_empty());
}

#[tokio::test]
async fn test_missing_credentials_are_unauthorized() {
    let (handler, routes) = create_handler(TierLimits::uniform(2), AdmissionPolicy::Stop, true);
    let (mut stream, task) = spawn_control(&handler);

    let (response, _) = send_handshake(&mut stream, &ControlRequest::default()).await;
    assert_eq!(response.status, 401);
    assert!(task.await.unwrap().is_err());
    assert!(routes.is_empty());
}

#[tokio::test]
async fn test_malformed_client_key_is_bad_request() {
    init_tracing();

    let (handler, routes) = create_handler(TierLimits::uniform(2), AdmissionPolicy::Stop, true);

    let mut point_at_infinity = vec![0x04];
    point_at_infinity.extend_from_slice(&[0u8; 64]);
    let bad_keys = [
        Some("04abcd".to_string()),
        Some(hex::encode(&point_at_infinity)),
        Some("not hex at all".to_string()),
        None,
    ];

    for client_public_key in bad_keys {
        let (mut stream, task) = spawn_control(&handler);
        let request = ControlRequest {
            host: Some("localhost".to_string()),
            username: Some("carol".to_string()),
            password: Some(PASSWORD.to_string()),
            client_public_key,
        };

        let (response, _) = send_handshake(&mut stream, &request).await;
        assert_eq!(response.status, 400);
        assert!(response.message.is_some());
        assert!(matches!(task.await.unwrap(), Err(ControlError::KeyExchange(_))));
    }

    assert!(routes.is_empty());
    assert!(handler.sessions().is_empty());
}

#[tokio::test]
async fn test_malformed_handshake_is_bad_request() {
    let (handler, _routes) = create_handler(TierLimits::uniform(2), AdmissionPolicy::Stop, true);
    let (mut stream, task) = spawn_control(&handler);

    stream.write_all(b"\x16\x03\x01 not http\r\n\r\n").await.unwrap();
    let mut buf = BytesMut::new();
    let response = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!(response.status, 400);
    assert!(matches!(task.await.unwrap(), Err(ControlError::Handshake(_))));
}

#[tokio::test(start_paused = true)]
async fn test_silent_client_times_out() {
    let (handler, _routes) = create_handler(TierLimits::uniform(2), AdmissionPolicy::Stop, true);
    let handler = Arc::new(
        Arc::try_unwrap(handler)
            .unwrap()
            .with_handshake_timeout(Duration::from_millis(100)),
    );
    let (_stream, task) = spawn_control(&handler);

    assert!(matches!(
        task.await.unwrap(),
        Err(ControlError::HandshakeTimeout(_))
    ));
    assert!(handler.sessions().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_policy_stops_accepting_at_cap() {
    init_tracing();

    let (handler, routes) = create_handler(TierLimits::new(2, 100.0), AdmissionPolicy::Stop, true);
    let (agent, task) = connect_agent(&handler, "dave", true).await;
    let session = handler.sessions().get("dave").unwrap();

    let mut first = open_public(&routes, &agent.public_host);
    let mut second = open_public(&routes, &agent.public_host);
    assert_eq!(roundtrip(&mut first, b"one").await, b"one");
    assert_eq!(roundtrip(&mut second, b"two").await, b"two");
    assert_eq!(session.admission.active(), 2);

    // The route stays up but nothing is accepted any more.
    let mut third = open_public(&routes, &agent.public_host);
    third.write_all(b"three").await.unwrap();
    let mut reply = [0u8; 5];
    assert!(tokio::time::timeout(Duration::from_millis(300), third.read_exact(&mut reply))
        .await
        .is_err());

    // Releasing a slot does not restart the loop.
    drop(first);
    eventually(|| session.admission.active() == 1).await;
    assert!(tokio::time::timeout(Duration::from_millis(300), third.read_exact(&mut reply))
        .await
        .is_err());
    assert!(routes.contains(&agent.public_host));

    agent.mux.close().await;
    task.await.unwrap().unwrap();
    assert!(routes.is_empty());
    assert!(handler.sessions().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_policy_admits_after_release() {
    init_tracing();

    let (handler, routes) = create_handler(TierLimits::new(2, 100.0), AdmissionPolicy::Wait, true);
    let (agent, task) = connect_agent(&handler, "erin", true).await;
    let session = handler.sessions().get("erin").unwrap();

    let mut first = open_public(&routes, &agent.public_host);
    let mut second = open_public(&routes, &agent.public_host);
    assert_eq!(roundtrip(&mut first, b"one").await, b"one");
    assert_eq!(roundtrip(&mut second, b"two").await, b"two");

    let mut third = open_public(&routes, &agent.public_host);
    third.write_all(b"three").await.unwrap();
    let mut reply = [0u8; 5];
    assert!(tokio::time::timeout(Duration::from_millis(300), third.read_exact(&mut reply))
        .await
        .is_err());
    assert_eq!(session.admission.active(), 2);

    drop(first);
    tokio::time::timeout(Duration::from_secs(5), third.read_exact(&mut reply))
        .await
        .expect("third connection was never admitted")
        .unwrap();
    assert_eq!(&reply, b"three");
    assert!(session.admission.active() <= 2);

    agent.mux.close().await;
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_replaces_session() {
    init_tracing();

    let (handler, routes) = create_handler(TierLimits::uniform(4), AdmissionPolicy::Stop, true);
    let (first, first_task) = connect_agent(&handler, "frank", true).await;
    let (second, second_task) = connect_agent(&handler, "frank", true).await;

    tokio::time::timeout(Duration::from_secs(5), first_task)
        .await
        .expect("replaced session did not end")
        .unwrap()
        .unwrap();

    assert_eq!(handler.sessions().len(), 1);
    assert_eq!(
        handler.sessions().get("frank").unwrap().public_host,
        second.public_host
    );
    assert!(!routes.contains(&first.public_host));
    assert!(routes.contains(&second.public_host));

    let mut user = open_public(&routes, &second.public_host);
    assert_eq!(roundtrip(&mut user, b"still here").await, b"still here");

    second.mux.close().await;
    second_task.await.unwrap().unwrap();
    assert!(handler.sessions().is_empty());
    assert!(routes.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequential_sessions_leave_no_state() {
    let (handler, routes) = create_handler(TierLimits::uniform(2), AdmissionPolicy::Stop, true);

    for i in 0..10 {
        let (agent, task) = connect_agent(&handler, &format!("user{}", i), true).await;
        agent.mux.close().await;
        task.await.unwrap().unwrap();
    }

    assert!(handler.sessions().is_empty());
    assert!(routes.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tampered_frame_ends_only_its_relay() {
    init_tracing();

    let (handler, routes) = create_handler(TierLimits::new(4, 100.0), AdmissionPolicy::Stop, true);
    let (agent, task) = connect_agent_tampering(&handler, "grace", true, Some(1)).await;
    let session = handler.sessions().get("grace").unwrap();

    let mut healthy = open_public(&routes, &agent.public_host);
    assert_eq!(roundtrip(&mut healthy, b"before").await, b"before");

    let mut tampered = open_public(&routes, &agent.public_host);
    let mut leaked = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), tampered.read_to_end(&mut leaked))
        .await
        .expect("tampered relay was not closed")
        .unwrap();
    assert!(leaked.is_empty());

    // The healthy relay and the pending accept still hold their tickets.
    eventually(|| session.admission.active() == 2).await;
    assert_eq!(roundtrip(&mut healthy, b"after").await, b"after");

    assert!(!agent.mux.is_closed());
    assert!(routes.contains(&agent.public_host));
    let mut fresh = open_public(&routes, &agent.public_host);
    assert_eq!(roundtrip(&mut fresh, b"fresh").await, b"fresh");

    agent.mux.close().await;
    task.await.unwrap().unwrap();
    assert!(handler.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_session_timeout_tears_session_down() {
    init_tracing();

    let (handler, routes) = create_handler(TierLimits::uniform(4), AdmissionPolicy::Stop, false);
    let handler = Arc::new(
        Arc::try_unwrap(handler)
            .unwrap()
            .with_session_timeout(Duration::from_secs(60)),
    );
    let (agent, task) = connect_agent(&handler, "heidi", false).await;
    let session = handler.sessions().get("heidi").unwrap();

    let mut user = open_public(&routes, &agent.public_host);
    assert_eq!(roundtrip(&mut user, b"ping").await, b"ping");
    drop(user);

    tokio::time::sleep(Duration::from_secs(61)).await;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session outlived its time limit")
        .unwrap()
        .unwrap();

    assert!(handler.sessions().is_empty());
    assert!(routes.is_empty());
    let late = PublicConnection::new(tokio::io::duplex(64).0, None, Bytes::new());
    assert!(matches!(
        routes.dispatch(&agent.public_host, late),
        Err(DispatchError::NotFound(_))
    ));
    assert_eq!(session.admission.active(), 0);

    tokio::time::timeout(Duration::from_secs(5), agent.mux.wait())
        .await
        .expect("agent did not observe the close");
    assert!(agent.mux.is_closed());
}
