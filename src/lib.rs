//! `zkbio` implements privacy preserving biometric authentication.
//!
//! Three services cooperate over framed JSON messages:
//!
//! - the **model** turns photos into embeddings and proves that two embeddings are similar,
//! - the **server** keeps encrypted templates and verifies proofs,
//! - the **user** holds the key and drives the registration and authentication sagas.
//!
//! The server never sees a plaintext embedding and the model never keeps one.

pub mod crypto;
pub mod extractor;
pub mod message;
pub mod net;
pub mod process;
pub mod proof;
pub mod services;
pub mod settings;
pub mod storage;
