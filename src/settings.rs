//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. Examples of
//! configuration files can be found in the `configs/` directory located in the repository root.

use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment};
use redis::{ConnectionInfo, IntoConnectionInfo};
use serde::{
    de::{self, DeserializeOwned, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{net::transport::TransportConfig, process::CommandSpec};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Loads and validates settings from a configuration file and the `ZKBIO_*` environment.
fn load<T>(path: impl AsRef<Path>) -> Result<T, SettingsError>
where
    T: DeserializeOwned + Validate,
{
    let settings: T = Config::builder()
        .add_source(config::File::from(path.as_ref()))
        .add_source(
            Environment::with_prefix("zkbio")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?
        .try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_model"))]
/// The settings of the model service.
pub struct ModelSettings {
    #[validate]
    pub node: NodeSettings,
    #[serde(default)]
    #[validate]
    pub transport: TransportSettings,
    pub log: LoggingSettings,
    #[validate]
    pub extractor: ExtractorSettings,
    #[validate]
    pub snark: SnarkSettings,
    #[validate]
    pub similarity: SimilaritySettings,
}

impl ModelSettings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load(path)
    }
}

fn validate_model(s: &ModelSettings) -> Result<(), ValidationError> {
    match s.snark.prove_command {
        Some(_) => Ok(()),
        None => Err(ValidationError::new("the model needs snark.prove_command")),
    }
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_server"))]
/// The settings of the server service.
pub struct ServerSettings {
    #[validate]
    pub node: NodeSettings,
    #[serde(default)]
    #[validate]
    pub transport: TransportSettings,
    pub log: LoggingSettings,
    #[validate]
    pub redis: RedisSettings,
    #[validate]
    pub snark: SnarkSettings,
}

impl ServerSettings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load(path)
    }
}

fn validate_server(s: &ServerSettings) -> Result<(), ValidationError> {
    match (&s.snark.setup_command, &s.snark.verify_command) {
        (Some(_), Some(_)) => Ok(()),
        _ => Err(ValidationError::new(
            "the server needs snark.setup_command and snark.verify_command",
        )),
    }
}

#[derive(Debug, Validate, Deserialize)]
/// The settings of the user service.
pub struct UserSettings {
    #[validate]
    pub node: NodeSettings,
    #[serde(default)]
    #[validate]
    pub transport: TransportSettings,
    pub log: LoggingSettings,
    #[validate]
    pub peers: PeerSettings,
    pub photos: PhotoSettings,
    #[serde(default)]
    #[validate]
    pub saga: SagaSettings,
}

impl UserSettings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load(path)
    }
}

/// Checks that `address` has the form `host:port`.
fn validate_peer_address(address: &str) -> Result<(), ValidationError> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(ValidationError::new("expected host:port")),
    }
}

#[derive(Debug, Deserialize, Validate, Clone)]
#[validate(schema(function = "validate_node"))]
/// Listening socket settings.
pub struct NodeSettings {
    /// The address to which the service is bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [node]
    /// bind_address = "0.0.0.0:8000"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ZKBIO_NODE__BIND_ADDRESS=0.0.0.0:8000
    /// ```
    pub bind_address: SocketAddr,

    /// The address other services reply to, sent as `return_to` with every request. Defaults to
    /// the bind address, which is only reachable by peers if it is not a wildcard address.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [node]
    /// public_address = "user:8001"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ZKBIO_NODE__PUBLIC_ADDRESS=user:8001
    /// ```
    #[serde(default)]
    pub public_address: Option<String>,
}

impl NodeSettings {
    pub fn public_address(&self) -> String {
        self.public_address
            .clone()
            .unwrap_or_else(|| self.bind_address.to_string())
    }
}

fn validate_node(s: &NodeSettings) -> Result<(), ValidationError> {
    match &s.public_address {
        Some(address) => validate_peer_address(address),
        None => Ok(()),
    }
}

#[derive(Debug, Deserialize, Validate, Clone, Copy)]
#[serde(default)]
/// Socket timeouts and frame limits.
pub struct TransportSettings {
    /// How long to wait for an outgoing connection, in milliseconds.
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,
    /// How long to wait for the frame of an incoming connection, in milliseconds.
    #[validate(range(min = 1))]
    pub read_timeout_ms: u64,
    /// The largest accepted frame, in bytes.
    #[validate(range(min = 1024))]
    pub max_frame_length: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let config = TransportConfig::default();
        Self {
            connect_timeout_ms: config.connect_timeout.as_millis() as u64,
            read_timeout_ms: config.read_timeout.as_millis() as u64,
            max_frame_length: config.max_frame_length,
        }
    }
}

impl From<TransportSettings> for TransportConfig {
    fn from(settings: TransportSettings) -> Self {
        Self {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            max_frame_length: settings.max_frame_length,
        }
    }
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// Feature extractor settings.
pub struct ExtractorSettings {
    /// The extractor program. The path of the image is appended to `args`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [extractor]
    /// command = "python3"
    /// args = ["extract.py"]
    /// ```
    #[validate(length(min = 1))]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// The directory images are staged in. The extractor runs in this directory.
    pub workdir: PathBuf,
    /// The length of every embedding.
    #[serde(default = "default_dimensions")]
    #[validate(range(min = 1))]
    pub dimensions: usize,
    #[serde(default = "default_extractor_timeout")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
}

impl ExtractorSettings {
    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(self.command.clone(), self.args.clone())
    }
}

fn default_dimensions() -> usize {
    512
}

fn default_extractor_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
/// Names of the toolchain files, relative to the toolchain work directory.
pub struct SnarkFiles {
    pub witness: String,
    pub proof: String,
    pub public_parameters: String,
    pub verification_key: String,
    pub proving_key: String,
    pub circuit: String,
}

impl Default for SnarkFiles {
    fn default() -> Self {
        Self {
            witness: "witness.json".into(),
            proof: "proof.json".into(),
            public_parameters: "public_parameters.json".into(),
            verification_key: "verification_key.json".into(),
            proving_key: "proving_key.zkey".into(),
            circuit: "circuit.wasm".into(),
        }
    }
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// zk-SNARK toolchain settings.
pub struct SnarkSettings {
    /// The directory the toolchain reads its inputs from and writes its outputs to.
    pub workdir: PathBuf,

    /// The trusted setup command. It runs without arguments and must produce the proving key,
    /// the circuit and the verification key. Only the server needs it.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [snark]
    /// setup_command = ["bash", "setup.sh"]
    /// ```
    #[serde(default)]
    pub setup_command: Option<CommandSpec>,
    /// The prover. It receives the path of the witness and must produce the proof and the
    /// public parameters. Only the model needs it.
    #[serde(default)]
    pub prove_command: Option<CommandSpec>,
    /// The verifier. It receives the paths of the proof, the public parameters and the
    /// verification key, and prints the success marker if the proof holds. Only the server
    /// needs it.
    #[serde(default)]
    pub verify_command: Option<CommandSpec>,

    #[serde(default)]
    pub files: SnarkFiles,

    #[serde(default = "default_snark_timeout")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,

    /// The fixed-point scale of embeddings and threshold.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [snark]
    /// scale = 1000000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ZKBIO_SNARK__SCALE=1000000
    /// ```
    #[serde(default = "default_scale")]
    #[validate(range(min = 1))]
    pub scale: u64,

    /// The literal the verifier prints on success.
    #[serde(default = "default_success_marker")]
    #[validate(length(min = 1))]
    pub success_marker: String,
}

fn default_snark_timeout() -> u64 {
    300
}

fn default_scale() -> u64 {
    1_000_000
}

fn default_success_marker() -> String {
    "OK!".into()
}

#[derive(Debug, Deserialize, Validate, Clone, Copy)]
#[validate(schema(function = "validate_similarity"))]
/// Similarity settings.
pub struct SimilaritySettings {
    /// The cosine similarity two embeddings must reach to be considered the same subject. The
    /// value must be between `0` and `1` (i.e. `0 < threshold <= 1`).
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [similarity]
    /// threshold = 0.7
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ZKBIO_SIMILARITY__THRESHOLD=0.7
    /// ```
    pub threshold: f64,
}

fn validate_similarity(s: &SimilaritySettings) -> Result<(), ValidationError> {
    if 0. < s.threshold && s.threshold <= 1. {
        Ok(())
    } else {
        Err(ValidationError::new("threshold out of range"))
    }
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// Redis settings.
pub struct RedisSettings {
    /// The URL where Redis is running.
    ///
    /// The format of the URL is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [redis]
    /// url = "redis://127.0.0.1/"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ZKBIO_REDIS__URL=redis://127.0.0.1/
    /// ```
    #[serde(deserialize_with = "deserialize_redis_url")]
    pub url: ConnectionInfo,

    /// The delay between two connection attempts at startup, in seconds.
    #[serde(default = "default_retry_delay")]
    #[validate(range(min = 1))]
    pub retry_delay_secs: u64,
}

fn default_retry_delay() -> u64 {
    5
}

fn deserialize_redis_url<'de, D>(deserializer: D) -> Result<ConnectionInfo, D::Error>
where
    D: Deserializer<'de>,
{
    struct ConnectionInfoVisitor;

    impl<'de> Visitor<'de> for ConnectionInfoVisitor {
        type Value = ConnectionInfo;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]"
            )
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value
                .into_connection_info()
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(ConnectionInfoVisitor)
}

#[derive(Debug, Deserialize, Validate, Clone)]
#[validate(schema(function = "validate_peers"))]
/// Addresses of the services the user talks to.
pub struct PeerSettings {
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [peers]
    /// model = "model:8002"
    /// server = "server:8000"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ZKBIO_PEERS__MODEL=model:8002
    /// ```
    pub model: String,
    pub server: String,
}

fn validate_peers(s: &PeerSettings) -> Result<(), ValidationError> {
    validate_peer_address(&s.model)?;
    validate_peer_address(&s.server)
}

#[derive(Debug, Deserialize, Clone)]
/// The photos the user binary registers and authenticates with.
pub struct PhotoSettings {
    pub registration: PathBuf,
    pub authentication: PathBuf,
}

#[derive(Debug, Deserialize, Validate, Clone, Copy)]
#[serde(default)]
/// Saga settings.
pub struct SagaSettings {
    /// How long a saga may take before it is abandoned, in seconds.
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
    /// The pause between registration and authentication of the user binary, in seconds.
    pub authentication_delay_secs: u64,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            authentication_delay_secs: 2,
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// ZKBIO_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
