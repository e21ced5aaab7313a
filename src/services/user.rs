//! The user service: the registration and authentication sagas.
//!
//! The user owns the symmetric key and the registration id. Both sagas are driven by replies
//! arriving on the user's own listener: each reply advances the saga in progress by one step.
//!
//! ```text
//! registration:   generate_embedding -> model
//!                 embedding          -> encrypt -> store_embedding -> server
//!                 registration_id    -> done
//!
//! authentication: get_embedding         -> server
//!                 encrypted_embedding   -> decrypt -> generate_snark_proof -> model
//!                 snark_proof           -> verify_snark_proof -> server
//!                 authentication_result -> done
//! ```
//!
//! At most one saga runs at a time.

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::{
    crypto::{CryptoError, SymmetricKey},
    message::{
        AuthenticationResult,
        Embedding,
        EncryptedEmbedding,
        ErrorPayload,
        Message,
        MessageType,
        PayloadError,
        ProofBundle,
        SnarkProofRequest,
        VerificationRequest,
    },
    net::{
        node::{MessageHandler, Outbox},
        transport::TransportError,
    },
};

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("another saga is in progress")]
    Busy,
    #[error("no registration to authenticate against")]
    NotRegistered,
    #[error("failed to reach {peer}: {source}")]
    Unreachable {
        peer: String,
        #[source]
        source: TransportError,
    },
    #[error("`{kind}`: {error}")]
    Remote { kind: MessageType, error: String },
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("saga abandoned")]
    Abandoned,
}

/// The addresses of the user's peers.
#[derive(Clone, Debug)]
pub struct Peers {
    pub model: String,
    pub server: String,
}

enum Saga {
    Registration {
        key: SymmetricKey,
        done: oneshot::Sender<Result<String, SagaError>>,
    },
    Authentication {
        photo: Vec<u8>,
        done: oneshot::Sender<Result<AuthenticationResult, SagaError>>,
    },
}

impl Saga {
    fn is_abandoned(&self) -> bool {
        match self {
            Saga::Registration { done, .. } => done.is_closed(),
            Saga::Authentication { done, .. } => done.is_closed(),
        }
    }
}

#[derive(Default)]
struct Session {
    key: Option<SymmetricKey>,
    registration_id: Option<String>,
    saga: Option<Saga>,
}

pub struct UserService {
    outbox: Outbox,
    peers: Peers,
    timeout: Duration,
    session: Mutex<Session>,
}

impl UserService {
    /// Creates a user service. `timeout` bounds each saga as a whole.
    pub fn new(outbox: Outbox, peers: Peers, timeout: Duration) -> Self {
        Self {
            outbox,
            peers,
            timeout,
            session: Mutex::new(Session::default()),
        }
    }

    /// The id the server assigned to the last successful registration.
    pub async fn registration_id(&self) -> Option<String> {
        self.session.lock().await.registration_id.clone()
    }

    /// Registers the face in `photo` and returns the registration id.
    ///
    /// A fresh key is generated for every registration. It replaces the current key only once
    /// the server has assigned an id, so a failed registration leaves the previous one usable.
    pub async fn register(&self, photo: &[u8]) -> Result<String, SagaError> {
        let (done, rx) = oneshot::channel();
        {
            let mut session = self.session.lock().await;
            if session.saga.is_some() {
                return Err(SagaError::Busy);
            }
            session.saga = Some(Saga::Registration {
                key: SymmetricKey::generate(),
                done,
            });
        }
        info!("registration started");

        let photo = base64::encode(photo);
        if let Err(err) = self
            .request(&self.peers.model, MessageType::GenerateEmbedding, &photo)
            .await
        {
            self.fail(err).await;
        }
        self.wait(rx).await
    }

    /// Authenticates the face in `photo` against the last registration.
    ///
    /// A rejection by the server is a successful saga with an unauthenticated result.
    pub async fn authenticate(&self, photo: &[u8]) -> Result<AuthenticationResult, SagaError> {
        let (done, rx) = oneshot::channel();
        let registration_id = {
            let mut session = self.session.lock().await;
            if session.saga.is_some() {
                return Err(SagaError::Busy);
            }
            let registration_id = match (&session.key, &session.registration_id) {
                (Some(_), Some(id)) => id.clone(),
                _ => return Err(SagaError::NotRegistered),
            };
            session.saga = Some(Saga::Authentication {
                photo: photo.to_vec(),
                done,
            });
            registration_id
        };
        info!("authentication started for {}", registration_id);

        if let Err(err) = self
            .request(&self.peers.server, MessageType::GetEmbedding, &registration_id)
            .await
        {
            self.fail(err).await;
        }
        self.wait(rx).await
    }

    /// Sends the next request of the saga in progress.
    async fn request<T: serde::Serialize>(
        &self,
        peer: &str,
        kind: MessageType,
        data: &T,
    ) -> Result<(), SagaError> {
        self.outbox
            .request(peer, kind, data)
            .await
            .map_err(|source| SagaError::Unreachable {
                peer: peer.to_string(),
                source,
            })?;
        debug!("sent `{}` to {}", kind, peer);
        Ok(())
    }

    async fn wait<T>(&self, rx: oneshot::Receiver<Result<T, SagaError>>) -> Result<T, SagaError> {
        let outcome = tokio::time::timeout(self.timeout, rx).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SagaError::Abandoned),
            Err(_) => {
                // the receiver is gone, so only a saga started after this one survives
                let mut session = self.session.lock().await;
                if session.saga.as_ref().map_or(false, Saga::is_abandoned) {
                    session.saga = None;
                }
                Err(SagaError::Timeout(self.timeout))
            }
        }
    }

    /// Ends the saga in progress with `error`.
    async fn fail(&self, error: SagaError) {
        warn!("saga failed: {}", error);
        match self.session.lock().await.saga.take() {
            Some(Saga::Registration { done, .. }) => {
                let _ = done.send(Err(error));
            }
            Some(Saga::Authentication { done, .. }) => {
                let _ = done.send(Err(error));
            }
            None => {}
        }
    }

    /// Decodes an `*_error` reply into the saga error it stands for.
    fn remote_error(message: &Message, kind: MessageType) -> SagaError {
        match message.payload_of::<ErrorPayload>(kind) {
            Ok(payload) => SagaError::Remote {
                kind,
                error: payload.error,
            },
            Err(err) => err.into(),
        }
    }

    async fn on_embedding(&self, message: &Message) -> Result<(), SagaError> {
        let embedding: Embedding = message.payload_of(MessageType::Embedding)?;
        let key = self.registration_key().await?;
        let package = key.encrypt_embedding(&embedding)?;
        debug!("encrypted embedding of dimension {}", embedding.len());
        self.request(&self.peers.server, MessageType::StoreEmbedding, &package)
            .await
    }

    async fn on_registration_id(&self, message: &Message) -> Result<(), SagaError> {
        let id: String = message.payload_of(MessageType::RegistrationId)?;
        let mut session = self.session.lock().await;
        if let Some(Saga::Registration { key, done }) = session.saga.take() {
            info!("registered as {}", id);
            session.key = Some(key);
            session.registration_id = Some(id.clone());
            let _ = done.send(Ok(id));
        }
        Ok(())
    }

    async fn on_encrypted_embedding(&self, message: &Message) -> Result<(), SagaError> {
        let stored: EncryptedEmbedding = message.payload_of(MessageType::EncryptedEmbedding)?;
        let (key, photo) = {
            let session = self.session.lock().await;
            match (&session.key, &session.saga) {
                (Some(key), Some(Saga::Authentication { photo, .. })) => {
                    (key.clone(), base64::encode(photo))
                }
                _ => return Err(SagaError::NotRegistered),
            }
        };
        let old_embedding = key.decrypt_embedding(&stored.package)?;
        let request = SnarkProofRequest {
            new_photo: photo,
            old_embedding,
            proving_key: stored.proving_key,
            circuit: stored.circuit,
        };
        self.request(&self.peers.model, MessageType::GenerateSnarkProof, &request)
            .await
    }

    async fn on_snark_proof(&self, message: &Message) -> Result<(), SagaError> {
        let bundle: ProofBundle = message.payload_of(MessageType::SnarkProof)?;
        let request = VerificationRequest {
            registration_id: self.registration_id().await,
            bundle,
        };
        self.request(&self.peers.server, MessageType::VerifySnarkProof, &request)
            .await
    }

    async fn on_authentication_result(&self, message: &Message) -> Result<(), SagaError> {
        let result: AuthenticationResult =
            message.payload_of(MessageType::AuthenticationResult)?;
        if let Some(Saga::Authentication { done, .. }) = self.session.lock().await.saga.take() {
            let _ = done.send(Ok(result));
        }
        Ok(())
    }

    /// The key of the registration in progress.
    async fn registration_key(&self) -> Result<SymmetricKey, SagaError> {
        match &self.session.lock().await.saga {
            Some(Saga::Registration { key, .. }) => Ok(key.clone()),
            _ => Err(SagaError::NotRegistered),
        }
    }

    /// Checks that `kind` belongs to the saga in progress.
    async fn expects(&self, kind: MessageType) -> bool {
        let session = self.session.lock().await;
        matches!(
            (&session.saga, kind),
            (
                Some(Saga::Registration { .. }),
                MessageType::Embedding
                    | MessageType::EmbeddingError
                    | MessageType::RegistrationId
                    | MessageType::RegistrationError
            ) | (
                Some(Saga::Authentication { .. }),
                MessageType::EncryptedEmbedding
                    | MessageType::SnarkProof
                    | MessageType::SnarkProofError
                    | MessageType::AuthenticationResult
            )
        )
    }
}

#[async_trait]
impl MessageHandler for UserService {
    async fn handle(&self, message: Message, peer: SocketAddr) {
        let kind = match message.message_type() {
            Ok(kind) => kind,
            Err(err) => return warn!("dropping message from {}: {}", peer, err),
        };
        if !self.expects(kind).await {
            return warn!("dropping `{}` from {}: no saga is waiting for it", kind, peer);
        }

        let step = match kind {
            MessageType::Embedding => self.on_embedding(&message).await,
            MessageType::RegistrationId => self.on_registration_id(&message).await,
            MessageType::EncryptedEmbedding => self.on_encrypted_embedding(&message).await,
            MessageType::SnarkProof => self.on_snark_proof(&message).await,
            MessageType::AuthenticationResult => self.on_authentication_result(&message).await,
            MessageType::EmbeddingError
            | MessageType::RegistrationError
            | MessageType::SnarkProofError => Err(Self::remote_error(&message, kind)),
            _ => Ok(()),
        };
        if let Err(err) = step {
            self.fail(err).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::EncryptedPackage,
        net::{node::ServiceNode, transport::TransportConfig},
    };
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Inbox(Mutex<mpsc::UnboundedSender<Message>>);

    #[async_trait]
    impl MessageHandler for Inbox {
        async fn handle(&self, message: Message, _peer: SocketAddr) {
            let _ = self.0.lock().await.send(message);
        }
    }

    async fn inbox() -> (String, mpsc::UnboundedReceiver<Message>) {
        let node = ServiceNode::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let addr = node.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(node.serve(Arc::new(Inbox(Mutex::new(tx)))));
        (addr, rx)
    }

    fn peer() -> SocketAddr {
        ([127, 0, 0, 1], 40000).into()
    }

    fn reply(kind: MessageType, data: impl serde::Serialize) -> Message {
        Message::new(kind, &data).unwrap()
    }

    async fn user(model: &str, server: &str, timeout: Duration) -> Arc<UserService> {
        let peers = Peers {
            model: model.to_string(),
            server: server.to_string(),
        };
        let outbox = Outbox::new("user:8001", TransportConfig::default());
        Arc::new(UserService::new(outbox, peers, timeout))
    }

    /// Runs a registration of `embedding` to completion and returns the stored package.
    async fn registered(
        user: &Arc<UserService>,
        model_rx: &mut mpsc::UnboundedReceiver<Message>,
        server_rx: &mut mpsc::UnboundedReceiver<Message>,
        embedding: Vec<f64>,
        id: &str,
    ) -> EncryptedPackage {
        let saga = tokio::spawn({
            let user = user.clone();
            async move { user.register(b"face").await }
        });
        model_rx.recv().await.unwrap();
        user.handle(reply(MessageType::Embedding, embedding), peer())
            .await;
        let stored = server_rx
            .recv()
            .await
            .unwrap()
            .payload_of(MessageType::StoreEmbedding)
            .unwrap();
        user.handle(reply(MessageType::RegistrationId, id), peer())
            .await;
        assert_eq!(saga.await.unwrap().unwrap(), id);
        stored
    }

    /// Authenticates against `stored` and returns the template the user decrypted from it.
    async fn decrypted_on_authentication(
        user: &Arc<UserService>,
        model_rx: &mut mpsc::UnboundedReceiver<Message>,
        server_rx: &mut mpsc::UnboundedReceiver<Message>,
        stored: EncryptedPackage,
        id: &str,
    ) -> Embedding {
        let saga = tokio::spawn({
            let user = user.clone();
            async move { user.authenticate(b"face again").await }
        });
        let get = server_rx.recv().await.unwrap();
        assert_eq!(
            get.payload_of::<String>(MessageType::GetEmbedding).unwrap(),
            id
        );
        let encrypted = EncryptedEmbedding {
            package: stored,
            proving_key: None,
            circuit: None,
        };
        user.handle(reply(MessageType::EncryptedEmbedding, encrypted), peer())
            .await;
        let request: SnarkProofRequest = model_rx
            .recv()
            .await
            .unwrap()
            .payload_of(MessageType::GenerateSnarkProof)
            .unwrap();

        user.handle(
            reply(MessageType::AuthenticationResult, AuthenticationResult::accepted(1)),
            peer(),
        )
        .await;
        assert!(saga.await.unwrap().unwrap().authenticated);
        request.old_embedding
    }

    #[tokio::test]
    async fn test_registration_saga() {
        let (model, mut model_rx) = inbox().await;
        let (server, mut server_rx) = inbox().await;
        let user = user(&model, &server, Duration::from_secs(5)).await;

        let saga = tokio::spawn({
            let user = user.clone();
            async move { user.register(b"face").await }
        });

        let request = model_rx.recv().await.unwrap();
        assert_eq!(request.return_to.as_deref(), Some("user:8001"));
        let photo: String = request.payload_of(MessageType::GenerateEmbedding).unwrap();
        assert_eq!(base64::decode(photo).unwrap(), b"face");

        user.handle(reply(MessageType::Embedding, vec![0.1, 0.2]), peer())
            .await;
        let store = server_rx.recv().await.unwrap();
        let package: EncryptedPackage =
            store.payload_of(MessageType::StoreEmbedding).unwrap();
        assert!(!package.data.contains("0.1"));

        user.handle(reply(MessageType::RegistrationId, "id-1"), peer())
            .await;
        assert_eq!(saga.await.unwrap().unwrap(), "id-1");
        assert_eq!(user.registration_id().await.as_deref(), Some("id-1"));
    }

    #[tokio::test]
    async fn test_embedding_error_fails_the_registration() {
        let (model, mut model_rx) = inbox().await;
        let user = user(&model, "127.0.0.1:9", Duration::from_secs(5)).await;

        let saga = tokio::spawn({
            let user = user.clone();
            async move { user.register(b"wall").await }
        });
        model_rx.recv().await.unwrap();
        user.handle(
            reply(
                MessageType::EmbeddingError,
                ErrorPayload::new("no face detected in image"),
            ),
            peer(),
        )
        .await;

        match saga.await.unwrap() {
            Err(SagaError::Remote { kind, error }) => {
                assert_eq!(kind, MessageType::EmbeddingError);
                assert_eq!(error, "no face detected in image");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(user.registration_id().await, None);
    }

    #[tokio::test]
    async fn test_authentication_requires_a_registration() {
        let user = user("127.0.0.1:9", "127.0.0.1:9", Duration::from_secs(5)).await;
        assert!(matches!(
            user.authenticate(b"face").await,
            Err(SagaError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_one_saga_at_a_time() {
        let (model, mut model_rx) = inbox().await;
        let user = user(&model, "127.0.0.1:9", Duration::from_secs(5)).await;

        let first = tokio::spawn({
            let user = user.clone();
            async move { user.register(b"face").await }
        });
        model_rx.recv().await.unwrap();
        assert!(matches!(user.register(b"face").await, Err(SagaError::Busy)));

        user.handle(
            reply(MessageType::RegistrationError, ErrorPayload::new("db down")),
            peer(),
        )
        .await;
        assert!(matches!(
            first.await.unwrap(),
            Err(SagaError::Remote { .. })
        ));
    }

    #[tokio::test]
    async fn test_saga_times_out() {
        let (model, _model_rx) = inbox().await;
        let user = user(&model, "127.0.0.1:9", Duration::from_millis(100)).await;

        assert!(matches!(
            user.register(b"face").await,
            Err(SagaError::Timeout(_))
        ));
        // the slot is free again
        let late = user.register(b"face").await;
        assert!(matches!(late, Err(SagaError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_fast() {
        let user = user("127.0.0.1:9", "127.0.0.1:9", Duration::from_secs(5)).await;
        assert!(matches!(
            user.register(b"face").await,
            Err(SagaError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_stray_reply_is_dropped() {
        let (model, mut model_rx) = inbox().await;
        let user = user(&model, "127.0.0.1:9", Duration::from_secs(5)).await;

        // nothing is running
        user.handle(reply(MessageType::RegistrationId, "id-0"), peer())
            .await;
        assert_eq!(user.registration_id().await, None);

        let saga = tokio::spawn({
            let user = user.clone();
            async move { user.register(b"face").await }
        });
        model_rx.recv().await.unwrap();
        // an authentication reply during a registration
        user.handle(
            reply(MessageType::AuthenticationResult, AuthenticationResult::accepted(1)),
            peer(),
        )
        .await;
        user.handle(reply(MessageType::RegistrationId, "id-1"), peer())
            .await;
        assert_eq!(saga.await.unwrap().unwrap(), "id-1");
    }

    #[tokio::test]
    async fn test_authentication_saga() {
        let (model, mut model_rx) = inbox().await;
        let (server, mut server_rx) = inbox().await;
        let user = user(&model, &server, Duration::from_secs(5)).await;

        // registration
        let saga = tokio::spawn({
            let user = user.clone();
            async move { user.register(b"face").await }
        });
        model_rx.recv().await.unwrap();
        user.handle(reply(MessageType::Embedding, vec![0.6, 0.8]), peer())
            .await;
        let stored: EncryptedPackage = server_rx
            .recv()
            .await
            .unwrap()
            .payload_of(MessageType::StoreEmbedding)
            .unwrap();
        user.handle(reply(MessageType::RegistrationId, "id-1"), peer())
            .await;
        saga.await.unwrap().unwrap();

        // authentication
        let saga = tokio::spawn({
            let user = user.clone();
            async move { user.authenticate(b"face again").await }
        });
        let get = server_rx.recv().await.unwrap();
        assert_eq!(
            get.payload_of::<String>(MessageType::GetEmbedding).unwrap(),
            "id-1"
        );

        let encrypted = EncryptedEmbedding {
            package: stored,
            proving_key: Some("cGs=".into()),
            circuit: None,
        };
        user.handle(reply(MessageType::EncryptedEmbedding, encrypted), peer())
            .await;
        let request: SnarkProofRequest = model_rx
            .recv()
            .await
            .unwrap()
            .payload_of(MessageType::GenerateSnarkProof)
            .unwrap();
        assert_eq!(request.old_embedding, Embedding(vec![0.6, 0.8]));
        assert_eq!(base64::decode(request.new_photo).unwrap(), b"face again");
        assert_eq!(request.proving_key.as_deref(), Some("cGs="));

        let bundle = ProofBundle {
            proof: serde_json::json!({"pi_a": []}),
            public_params: serde_json::json!(["1"]),
        };
        user.handle(reply(MessageType::SnarkProof, bundle.clone()), peer())
            .await;
        let verify: VerificationRequest = server_rx
            .recv()
            .await
            .unwrap()
            .payload_of(MessageType::VerifySnarkProof)
            .unwrap();
        assert_eq!(verify.bundle, bundle);
        assert_eq!(verify.registration_id.as_deref(), Some("id-1"));

        user.handle(
            reply(
                MessageType::AuthenticationResult,
                AuthenticationResult::accepted(1_700_000_000),
            ),
            peer(),
        )
        .await;
        let result = saga.await.unwrap().unwrap();
        assert!(result.authenticated);
        assert_eq!(result.timestamp, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_failed_registration_keeps_the_previous_one() {
        let (model, mut model_rx) = inbox().await;
        let (server, mut server_rx) = inbox().await;
        let user = user(&model, &server, Duration::from_secs(5)).await;
        let stored = registered(&user, &mut model_rx, &mut server_rx, vec![0.6, 0.8], "id-1")
            .await;

        // the second template is encrypted and sent, then the server refuses it
        let saga = tokio::spawn({
            let user = user.clone();
            async move { user.register(b"face").await }
        });
        model_rx.recv().await.unwrap();
        user.handle(reply(MessageType::Embedding, vec![0.8, 0.6]), peer())
            .await;
        server_rx.recv().await.unwrap();
        user.handle(
            reply(MessageType::RegistrationError, ErrorPayload::new("db down")),
            peer(),
        )
        .await;
        assert!(matches!(
            saga.await.unwrap(),
            Err(SagaError::Remote { .. })
        ));

        // a model without a face
        let saga = tokio::spawn({
            let user = user.clone();
            async move { user.register(b"wall").await }
        });
        model_rx.recv().await.unwrap();
        user.handle(
            reply(
                MessageType::EmbeddingError,
                ErrorPayload::new("no face detected in image"),
            ),
            peer(),
        )
        .await;
        assert!(saga.await.unwrap().is_err());

        assert_eq!(user.registration_id().await.as_deref(), Some("id-1"));
        let old =
            decrypted_on_authentication(&user, &mut model_rx, &mut server_rx, stored, "id-1")
                .await;
        assert_eq!(old, Embedding(vec![0.6, 0.8]));
    }

    #[tokio::test]
    async fn test_timed_out_registration_keeps_the_previous_one() {
        let (model, mut model_rx) = inbox().await;
        let (server, mut server_rx) = inbox().await;
        let user = user(&model, &server, Duration::from_secs(1)).await;
        let stored = registered(&user, &mut model_rx, &mut server_rx, vec![0.6, 0.8], "id-1")
            .await;

        let saga = tokio::spawn({
            let user = user.clone();
            async move { user.register(b"face").await }
        });
        model_rx.recv().await.unwrap();
        user.handle(reply(MessageType::Embedding, vec![0.8, 0.6]), peer())
            .await;
        server_rx.recv().await.unwrap();
        // no registration id ever arrives
        assert!(matches!(
            saga.await.unwrap(),
            Err(SagaError::Timeout(_))
        ));

        assert_eq!(user.registration_id().await.as_deref(), Some("id-1"));
        let old =
            decrypted_on_authentication(&user, &mut model_rx, &mut server_rx, stored, "id-1")
                .await;
        assert_eq!(old, Embedding(vec![0.6, 0.8]));
    }
}
