//! CME Server - change management engine node
//!
//! Hosts the per-type repositories, runs the background reconciler and
//! serves the smart-HTTP endpoints other nodes push to and pull from.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use cme_core::{Config, Engine, ObjectType, Reconciler};
use cme_http::{DEFAULT_MAX_BODY_SIZE, HttpResponse, SmartHttpHandler, full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CME Server Configuration
#[derive(Parser, Debug)]
#[command(name = "cme")]
#[command(author = "CME Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Change management engine node", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "/etc/cme/cme.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address, overriding `server.listen`
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Create every object type's repository
    Init,

    /// List the objects of one type
    List {
        /// Object type (device, policy, query, report, ontology)
        object_type: ObjectType,
    },

    /// Show the history of one type, optionally limited to a path
    Log {
        object_type: ObjectType,

        /// Path inside the repository, e.g. an object name
        path: Option<String>,

        /// Number of entries (0 for all)
        #[arg(short = 'n', long, default_value_t = 0)]
        limit: usize,
    },
}

/// `[server]` table of the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ServerConfig {
    listen: String,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
    /// Largest smart-HTTP request body, in bytes
    max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            tls_cert: None,
            tls_key: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ServerConfig {
    fn from_toml(text: &str) -> Result<Self> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Document {
            server: ServerConfig,
        }
        let doc: Document = toml::from_str(text).context("Invalid [server] configuration")?;
        Ok(doc.server)
    }

    fn tls_paths(&self) -> Result<Option<(&Path, &Path)>> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some((cert.as_path(), key.as_path()))),
            (None, None) => Ok(None),
            _ => bail!("server.tls_cert and server.tls_key must be set together"),
        }
    }
}

fn init_tracing(level: &str, debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read {:?}", cli.config))?;
    let config = Config::from_toml(&text)?;
    init_tracing(&config.engine.log_level, cli.debug);

    let engine = Arc::new(Engine::new(config.engine.clone())?);

    match cli.command {
        Commands::Start { addr } => {
            let mut server = ServerConfig::from_toml(&text)?;
            if let Some(addr) = addr {
                server.listen = addr;
            }
            serve(engine, config, server).await?;
        }

        Commands::Init => {
            for object_type in ObjectType::ALL {
                let dir = engine.ensure_repo(object_type).await?;
                println!("{:<9} {}", object_type, dir.display());
            }
        }

        Commands::List { object_type } => {
            for name in engine.list_objects(object_type).await? {
                println!("{}", name);
            }
        }

        Commands::Log {
            object_type,
            path,
            limit,
        } => {
            let path = path.unwrap_or_default();
            for entry in engine.log(object_type, &path, limit).await? {
                println!("{}", entry);
            }
        }
    }

    Ok(())
}

async fn serve(engine: Arc<Engine>, config: Config, server: ServerConfig) -> Result<()> {
    info!("Storage root: {:?}", config.engine.repo_path);
    let reconciler = Reconciler::new(Arc::clone(&engine), config.reconciler.clone()).start();
    let handler = Arc::new(
        SmartHttpHandler::new(Arc::clone(&engine))?.with_max_body_size(server.max_body_size),
    );

    let tls = match server.tls_paths()? {
        Some((cert, key)) => Some(tls_acceptor(cert, key)?),
        None => None,
    };

    let addr: SocketAddr = server
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address {:?}", server.listen))?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        "Server listening on {} ({})",
        addr,
        if tls.is_some() { "https" } else { "http" }
    );

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        };

        let handler = Arc::clone(&handler);
        match &tls {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(stream) => serve_connection(stream, handler).await,
                        Err(e) => warn!("TLS handshake with {} failed: {}", peer, e),
                    }
                });
            }
            None => {
                tokio::spawn(serve_connection(stream, handler));
            }
        }
    }

    reconciler.shutdown().await;
    engine.close();
    Ok(())
}

async fn serve_connection<IO>(stream: IO, handler: Arc<SmartHttpHandler>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    if let Err(e) = http1::Builder::new()
        .serve_connection(io, service_fn(move |req| handle_request(req, Arc::clone(&handler))))
        .await
    {
        error!("Error serving connection: {:?}", e);
    }
}

/// Handle incoming HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    handler: Arc<SmartHttpHandler>,
) -> Result<HttpResponse, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = match handler.handle(req).await {
        Ok(resp) => resp,
        Err(e) => {
            error!("Request error: {} {}: {}", method, uri, e);
            let mut resp = Response::new(full(format!("Error: {}", e)));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    };

    info!("{} {} -> {}", method, uri, response.status());
    Ok(response)
}

fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(
        File::open(cert).with_context(|| format!("Failed to open {:?}", cert))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid certificate in {:?}", cert))?;

    let mut key_reader =
        BufReader::new(File::open(key).with_context(|| format!("Failed to open {:?}", key))?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("Invalid private key in {:?}", key))?
        .with_context(|| format!("No private key in {:?}", key))?;

    let tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(tls)))
}
