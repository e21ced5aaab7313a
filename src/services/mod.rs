//! The three protocol participants.
//!
//! Each service is a [`MessageHandler`](crate::net::node::MessageHandler) served by a
//! [`ServiceNode`](crate::net::node::ServiceNode).

pub mod model;
pub mod server;
pub mod user;

pub use self::{
    model::ModelService,
    server::{bootstrap, ServerService},
    user::{Peers, SagaError, UserService},
};
