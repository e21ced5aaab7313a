//! The bind/accept/dispatch loop shared by all three services.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    message::{Message, MessageType},
    net::transport::{self, TransportConfig, TransportError},
};

/// Something that reacts to one incoming message.
///
/// Handlers run on their own task, one per connection. They never answer on the incoming
/// connection: replies are pushed to the message's `return_to` address with an [`Outbox`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message, peer: SocketAddr);
}

/// A listening service endpoint.
pub struct ServiceNode {
    listener: TcpListener,
    config: TransportConfig,
}

impl ServiceNode {
    /// Binds the listening socket.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: TransportConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, spawning one task per connection.
    ///
    /// A failing connection never affects the accept loop or other connections.
    pub async fn serve<H: MessageHandler>(self, handler: Arc<H>) {
        match self.listener.local_addr() {
            Ok(addr) => info!("listening on {}", addr),
            Err(err) => warn!("listening on an unknown address: {}", err),
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("failed to accept connection: {}", err);
                    continue;
                }
            };
            let handler = handler.clone();
            let config = self.config;
            tokio::spawn(
                handle_connection(stream, peer, handler, config)
                    .instrument(info_span!("connection", peer = %peer)),
            );
        }
    }
}

async fn handle_connection<H: MessageHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    config: TransportConfig,
) {
    match transport::recv(stream, &config).await {
        Ok(message) => {
            debug!("received `{}`", message.kind);
            handler.handle(message, peer).await;
        }
        Err(err) => warn!("dropping connection: {}", err),
    }
}

/// Sends requests and replies on behalf of a service.
#[derive(Clone, Debug)]
pub struct Outbox {
    /// The address peers must reply to.
    public_address: String,
    config: TransportConfig,
}

impl Outbox {
    pub fn new(public_address: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            public_address: public_address.into(),
            config,
        }
    }

    pub fn public_address(&self) -> &str {
        &self.public_address
    }

    /// Sends a request to `addr`, asking for the reply to come back to this service.
    pub async fn request<T: Serialize>(
        &self,
        addr: &str,
        kind: MessageType,
        data: &T,
    ) -> Result<(), TransportError> {
        let message = Message::new(kind, data)
            .map_err(TransportError::Encode)?
            .reply_to(self.public_address.clone());
        transport::send(addr, &message, &self.config).await
    }

    /// Pushes a reply to `return_to`. Failures are logged: there is nobody left to tell.
    pub async fn reply<T: Serialize>(&self, return_to: &str, kind: MessageType, data: &T) {
        let message = match Message::new(kind, data) {
            Ok(message) => message,
            Err(err) => {
                error!("failed to encode `{}` reply: {}", kind, err);
                return;
            }
        };
        match transport::send(return_to, &message, &self.config).await {
            Ok(()) => debug!("replied `{}` to {}", kind, return_to),
            Err(err) => error!("failed to reply `{}` to {}: {}", kind, return_to, err),
        }
    }
}

/// Returns the reply address of a request, logging the protocol violation if it is missing.
pub fn return_address(message: &Message) -> Option<&str> {
    let address = message.return_to.as_deref().filter(|addr| !addr.is_empty());
    if address.is_none() {
        warn!("dropping `{}`: no return address", message.kind);
    }
    address
}
