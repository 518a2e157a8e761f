//! Veil CLI tools: key generation, endpoint server, requests.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use veil_bus::keyserver;
use veil_bus::{Client, Correlator, EndpointServer, Identity, MqttBroker, Reply, SessionOptions};
use veil_common::{Config, JsonFileStore, KeyValueStore, MemoryStore};
use veil_core::{Dispatcher, DispatcherConfig, RouteOptions};
use veil_crypto::{KeyPair, PublicKey, DEFAULT_KEY_BITS};

/// Configuration key of the server key learned by `request`.
const SERVER_KEY_CONFIG: &str = "server-public-key";

#[derive(Parser, Debug)]
#[command(name = "veil")]
#[command(about = "Veil secure endpoint tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct BrokerArgs {
    /// MQTT broker host
    #[arg(long, env = "VEIL_BROKER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// MQTT broker port
    #[arg(long, env = "VEIL_BROKER_PORT", default_value_t = 1883)]
    port: u16,
}

#[derive(ClapArgs, Debug)]
struct IdentityArgs {
    /// Identifier announced in every frame
    #[arg(long, env = "VEIL_ID")]
    id: String,

    /// Private key file (PKCS#1 PEM)
    #[arg(short, long)]
    key: PathBuf,

    /// JSON state file; kept in memory when omitted
    #[arg(long, env = "VEIL_STORE")]
    store: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new RSA identity keypair
    Keygen {
        /// Modulus size in bits
        #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,

        /// Output file path (without extension)
        #[arg(short, long, default_value = "veil")]
        output: String,
    },

    /// Show a public key and its fingerprint
    ShowKey {
        /// Public key file path
        #[arg(short, long)]
        key: PathBuf,
    },

    /// Serve endpoints until interrupted
    Serve {
        #[command(flatten)]
        broker: BrokerArgs,

        #[command(flatten)]
        identity: IdentityArgs,

        /// Write Markdown route documentation to this file
        #[arg(long)]
        docs: Option<PathBuf>,
    },

    /// Send one request to a server
    Request {
        #[command(flatten)]
        broker: BrokerArgs,

        #[command(flatten)]
        identity: IdentityArgs,

        /// Endpoint topic
        #[arg(short, long)]
        topic: String,

        /// JSON request body
        #[arg(short, long, default_value = "{}")]
        message: String,

        /// Server public key file; looked up through the keyserver when absent
        #[arg(long)]
        server_key: Option<PathBuf>,

        /// Seconds to wait for each reply
        #[arg(long, default_value_t = 15)]
        timeout: u64,

        /// Publish without waiting for a reply
        #[arg(long, default_value_t = false)]
        no_wait: bool,

        /// Allow plain-text requests to keyserver topics
        #[arg(long, default_value_t = false)]
        insecure: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    veil_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Keygen { bits, output } => {
            println!("Generating {}-bit RSA keypair...", bits);

            let keypair = KeyPair::generate(bits)?;
            let private_path = format!("{}.key", output);
            let public_path = format!("{}.pub", output);

            keypair.save(&private_path, &public_path)?;

            println!("Private key: {}", private_path);
            println!("Public key:  {}", public_path);
            println!("Fingerprint: {}", keypair.public_key().fingerprint());
        }
        Command::ShowKey { key } => {
            let public = PublicKey::load(&key)
                .with_context(|| format!("failed to load public key {}", key.display()))?;
            let pem = public.to_pem()?;
            print!("{}", pem);
            println!("Fingerprint: {}", public.fingerprint());
            println!("Bits:        {}", public.bits());
            println!(
                "Usable:      {}",
                if PublicKey::looks_like_pem(&pem) { "yes" } else { "no" }
            );
        }
        Command::Serve {
            broker,
            identity,
            docs,
        } => serve(broker, identity, docs).await?,
        Command::Request {
            broker,
            identity,
            topic,
            message,
            server_key,
            timeout,
            no_wait,
            insecure,
        } => {
            let message: Value =
                serde_json::from_str(&message).context("--message is not valid JSON")?;
            let options = RequestOptions {
                server_key,
                timeout: Duration::from_secs(timeout),
                wait: !no_wait,
                insecure,
            };
            request(broker, identity, &topic, message, options).await?;
        }
        Command::Version => {
            println!("veil {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn load_identity(args: &IdentityArgs) -> Result<Identity> {
    let keys = KeyPair::load(&args.key)
        .with_context(|| format!("failed to load private key {}", args.key.display()))?;
    Ok(Identity::new(args.id.as_str(), Arc::new(keys)))
}

fn open_store(path: Option<&Path>) -> Result<Arc<dyn KeyValueStore>> {
    Ok(match path {
        Some(path) => Arc::new(JsonFileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    })
}

async fn serve(broker: BrokerArgs, identity: IdentityArgs, docs: Option<PathBuf>) -> Result<()> {
    let store = open_store(identity.store.as_deref())?;
    let identity = load_identity(&identity)?;
    let mqtt = MqttBroker::new(broker.host, broker.port);

    let paired = keyserver::paired_key(store.clone());
    if paired.is_some() {
        info!("restoring previously paired client key");
    }
    let options = SessionOptions::new(identity).with_remote_key(paired);
    let session = Arc::new(veil_bus::TransportSession::connect(&mqtt, options).await?);

    let mut dispatcher = Dispatcher::with_config(DispatcherConfig {
        documentation_path: docs,
    });
    dispatcher
        .route_with(
            "ping",
            RouteOptions::described("Liveness check, answers `pong`."),
            |_, _| Ok(json!("pong")),
        )
        .route_with(
            "client/+/ping",
            RouteOptions::described("Echoes the client id from the topic."),
            |args, _| Ok(json!(args.first().cloned().unwrap_or_default())),
        );
    keyserver::install(&mut dispatcher, session.clone(), store)?;

    info!(address = %mqtt.address(), "serving endpoints, press Ctrl-C to stop");
    EndpointServer::with_session(session, dispatcher)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;
    Ok(())
}

struct RequestOptions {
    server_key: Option<PathBuf>,
    timeout: Duration,
    wait: bool,
    insecure: bool,
}

async fn request(
    broker: BrokerArgs,
    identity: IdentityArgs,
    topic: &str,
    message: Value,
    options: RequestOptions,
) -> Result<()> {
    let config = Config::new(open_store(identity.store.as_deref())?);
    let identity = load_identity(&identity)?;

    let server_key = match &options.server_key {
        Some(path) => Some(PublicKey::load(path)?.to_pem()?),
        None => config.get::<String>(SERVER_KEY_CONFIG)?,
    };

    let mqtt = MqttBroker::new(broker.host, broker.port);
    let correlator = Correlator::new(Arc::new(mqtt));
    let mut client = Client::connect(identity, correlator, server_key, options.timeout)
        .await?
        .with_request_timeout(options.timeout);
    if options.insecure {
        client.allow_insecure();
    }
    if let Some(pem) = client.server_key() {
        config.set(SERVER_KEY_CONFIG, pem)?;
    }

    match client.request(topic, message, options.wait).await? {
        Reply::Value(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Reply::Detached => println!("sent"),
        Reply::TimedOut => bail!("no reply on {} within {:?}", topic, options.timeout),
    }
    Ok(())
}
