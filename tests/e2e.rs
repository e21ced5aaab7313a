//! Runs the three services in-process over real sockets, with a fake extractor and a proof
//! backend that checks cosine similarity in the clear.

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
};
use zkbio::{
    extractor::{ExtractionError, FeatureExtractor},
    message::{AuthenticationResult, Embedding, Message, MessageType, ProofBundle},
    net::{
        node::{MessageHandler, Outbox, ServiceNode},
        transport::TransportConfig,
    },
    proof::{ProofBackend, ProofError, ProvingArtifacts, TrustedSetup, Verdict},
    services::{bootstrap, server, ModelService, Peers, SagaError, ServerService, UserService},
    storage::{memory::InMemoryStorage, EmbeddingStorage},
};

const VERIFICATION_KEY: &str = "{\"protocol\":\"cosine\"}";
const DIMENSIONS: usize = 3;

struct FakeExtractor {
    faces: HashMap<Vec<u8>, Vec<f64>>,
}

impl FakeExtractor {
    fn new() -> Self {
        let mut faces = HashMap::new();
        faces.insert(b"alice-1".to_vec(), vec![0.9, 0.1, 0.1]);
        faces.insert(b"alice-2".to_vec(), vec![0.85, 0.15, 0.1]);
        faces.insert(b"bob".to_vec(), vec![0.1, 0.1, 0.9]);
        Self { faces }
    }
}

#[async_trait]
impl FeatureExtractor for FakeExtractor {
    async fn extract(&self, image: &[u8]) -> Result<Embedding, ExtractionError> {
        self.faces
            .get(image)
            .cloned()
            .map(Embedding)
            .ok_or(ExtractionError::NotFound)
    }
}

/// Proves nothing, but keeps the shape of a real backend: the similarity bit ends up in the
/// public parameters and only the verification key from the setup is accepted.
struct CosineBackend;

#[async_trait]
impl ProofBackend for CosineBackend {
    async fn run_trusted_setup(&self) -> Result<TrustedSetup, ProofError> {
        Ok(TrustedSetup {
            proving_key: b"zkey".to_vec(),
            circuit: b"wasm".to_vec(),
            verification_key: VERIFICATION_KEY.to_string(),
        })
    }

    async fn generate_proof(
        &self,
        old: &Embedding,
        new: &Embedding,
        threshold: f64,
        artifacts: Option<ProvingArtifacts>,
    ) -> Result<ProofBundle, ProofError> {
        assert_eq!(
            artifacts,
            Some(ProvingArtifacts {
                proving_key: b"zkey".to_vec(),
                circuit: b"wasm".to_vec(),
            })
        );
        let similarity = old
            .cosine_similarity(new)
            .ok_or(ProofError::DimensionMismatch {
                old: old.len(),
                new: new.len(),
            })?;
        let bit = if similarity >= threshold { "1" } else { "0" };
        Ok(ProofBundle {
            proof: json!({"protocol": "cosine"}),
            public_params: json!([bit]),
        })
    }

    async fn verify_proof(
        &self,
        bundle: &ProofBundle,
        verification_key: &str,
    ) -> Result<Verdict, ProofError> {
        if bundle.proof.is_null() || bundle.public_params.is_null() {
            return Err(ProofError::IncompleteBundle);
        }
        if verification_key == VERIFICATION_KEY && bundle.public_params == json!(["1"]) {
            Ok(Verdict::Valid)
        } else {
            Ok(Verdict::Invalid {
                details: "[ERROR] Invalid proof".to_string(),
            })
        }
    }
}

struct Inbox(Mutex<mpsc::UnboundedSender<Message>>);

#[async_trait]
impl MessageHandler for Inbox {
    async fn handle(&self, message: Message, _peer: SocketAddr) {
        let _ = self.0.lock().await.send(message);
    }
}

struct Deployment {
    user: Arc<UserService>,
    server: String,
    store: InMemoryStorage,
}

async fn bind() -> (ServiceNode, String) {
    let node = ServiceNode::bind("127.0.0.1:0", TransportConfig::default())
        .await
        .unwrap();
    let addr = node.local_addr().unwrap().to_string();
    (node, addr)
}

fn connect_to(
    store: &InMemoryStorage,
) -> impl FnMut() -> futures::future::Ready<Result<InMemoryStorage, Infallible>> {
    let store = store.clone();
    move || futures::future::ready(Ok(store.clone()))
}

async fn deploy() -> Deployment {
    let config = TransportConfig::default();
    let store = InMemoryStorage::new();
    let backend = CosineBackend;
    let ready = bootstrap(connect_to(&store), Duration::from_millis(10), &backend)
        .await
        .unwrap();

    let (server_node, server) = bind().await;
    let (model_node, model) = bind().await;
    let (user_node, user) = bind().await;

    let server_service = ServerService::new(ready, backend, Outbox::new(&server, config));
    tokio::spawn(server_node.serve(Arc::new(server_service)));

    let model_service = ModelService::new(
        FakeExtractor::new(),
        CosineBackend,
        Outbox::new(&model, config),
        0.7,
        DIMENSIONS,
    );
    tokio::spawn(model_node.serve(Arc::new(model_service)));

    let peers = Peers {
        model,
        server: server.clone(),
    };
    let user_service = Arc::new(UserService::new(
        Outbox::new(&user, config),
        peers,
        Duration::from_secs(10),
    ));
    tokio::spawn(user_node.serve(user_service.clone()));

    Deployment {
        user: user_service,
        server,
        store,
    }
}

#[tokio::test]
async fn registered_user_authenticates_with_a_similar_face() {
    let deployment = deploy().await;

    let id = deployment.user.register(b"alice-1").await.unwrap();
    assert_eq!(deployment.store.embedding_count().await, 1);

    let result = deployment.user.authenticate(b"alice-2").await.unwrap();
    assert!(result.authenticated, "{:?}", result);
    assert!(result.timestamp.is_some());
    assert_eq!(deployment.user.registration_id().await, Some(id));
}

#[tokio::test]
async fn different_face_is_rejected() {
    let deployment = deploy().await;

    deployment.user.register(b"alice-1").await.unwrap();
    let result = deployment.user.authenticate(b"bob").await.unwrap();

    assert!(!result.authenticated);
    assert_eq!(result.reason.as_deref(), Some(server::INVALID_PROOF));
    assert_eq!(result.details.as_deref(), Some("[ERROR] Invalid proof"));
}

#[tokio::test]
async fn photo_without_a_face_fails_the_registration() {
    let deployment = deploy().await;

    match deployment.user.register(b"a wall").await {
        Err(SagaError::Remote { kind, error }) => {
            assert_eq!(kind, MessageType::EmbeddingError);
            assert_eq!(error, "no face detected in image");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(deployment.store.embedding_count().await, 0);
    assert!(matches!(
        deployment.user.authenticate(b"alice-2").await,
        Err(SagaError::NotRegistered)
    ));
}

#[tokio::test]
async fn authentication_photo_without_a_face_is_an_error() {
    let deployment = deploy().await;

    deployment.user.register(b"alice-1").await.unwrap();
    match deployment.user.authenticate(b"a wall").await {
        Err(SagaError::Remote { kind, .. }) => assert_eq!(kind, MessageType::SnarkProofError),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn registering_twice_stores_two_templates() {
    let deployment = deploy().await;

    let first = deployment.user.register(b"alice-1").await.unwrap();
    let second = deployment.user.register(b"alice-1").await.unwrap();

    assert_ne!(first, second);
    assert_eq!(deployment.store.embedding_count().await, 2);
}

#[tokio::test]
async fn failed_registration_keeps_the_previous_one() {
    let deployment = deploy().await;

    let id = deployment.user.register(b"alice-1").await.unwrap();
    assert!(matches!(
        deployment.user.register(b"a wall").await,
        Err(SagaError::Remote { .. })
    ));

    let result = deployment.user.authenticate(b"alice-2").await.unwrap();
    assert!(result.authenticated, "{:?}", result);
    assert_eq!(deployment.user.registration_id().await, Some(id));
    assert_eq!(deployment.store.embedding_count().await, 1);
}

#[tokio::test]
async fn unknown_registration_id_is_not_found() {
    let deployment = deploy().await;
    let (inbox_node, inbox) = bind().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(inbox_node.serve(Arc::new(Inbox(Mutex::new(tx)))));

    Outbox::new(&inbox, TransportConfig::default())
        .request(
            &deployment.server,
            MessageType::GetEmbedding,
            &"0d9f5a52-9d3c-4a47-8f0e-6b1c9f2f3a11",
        )
        .await
        .unwrap();

    let result: AuthenticationResult = rx
        .recv()
        .await
        .unwrap()
        .payload_of(MessageType::AuthenticationResult)
        .unwrap();
    assert!(!result.authenticated);
    assert_eq!(result.reason.as_deref(), Some(server::NOT_FOUND));
}

#[tokio::test]
async fn server_accepts_nothing_until_the_store_is_ready() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let addr = format!("127.0.0.1:{}", port);

    let store = InMemoryStorage::new();
    store.set_ready(false).await;

    let startup = tokio::spawn({
        let store = store.clone();
        let addr = addr.clone();
        async move {
            let backend = CosineBackend;
            let ready = bootstrap(connect_to(&store), Duration::from_millis(50), &backend)
                .await
                .unwrap();
            let node = ServiceNode::bind(&addr, TransportConfig::default())
                .await
                .unwrap();
            let outbox = Outbox::new(&addr, TransportConfig::default());
            node.serve(Arc::new(ServerService::new(ready, backend, outbox)))
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(TcpStream::connect(&addr).await.is_err());

    store.set_ready(true).await;
    let mut accepted = false;
    for _ in 0..50 {
        if TcpStream::connect(&addr).await.is_ok() {
            accepted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(accepted);

    let mut store = store;
    assert!(store
        .artifact(zkbio::storage::ArtifactKind::VerificationKey)
        .await
        .unwrap()
        .is_some());
    startup.abort();
}
