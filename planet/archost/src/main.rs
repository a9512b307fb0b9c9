//! `archost` daemon and client: serve planet host sessions over a Unix
//! socket, resolve schema defs offline, and pin cells from the command line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use planet_core::{
    AttrValue, Context as Lifecycle, Host, HostConfig, MemoryApp, Planet, TypeRegistry,
};
use planet_spec::{
    Defs, Msg, MsgOp, PinRequest, PlanetId, Value, DEFAULT_APP_FOR_DATA_MODEL,
};
use planet_transport::{ClientConn, UnixIpc};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Archost command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase output verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Host configuration.
    #[arg(
        long,
        env = "ARCHOST_CONFIG",
        value_name = "FILE",
        help = "Path to a JSON-encoded HostConfig; missing fields take defaults"
    )]
    config: Option<PathBuf>,
    /// Subcommand.
    #[command(subcommand)]
    command: Commands,
}

/// Commands for archost.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the host and serve sessions until interrupted.
    Daemon {
        /// Unix socket to listen on.
        #[arg(long, env = "ARCHOST_SOCKET", default_value = "/tmp/archost.sock")]
        socket: PathBuf,
        /// JSON object mapping URIs to attribute objects, served by the default app.
        #[arg(long, value_name = "FILE")]
        docs: Option<PathBuf>,
        /// App URI of the built-in document app.
        #[arg(long, default_value = "archost/memory/v1.0.0")]
        app_uri: String,
    },
    /// Resolve a JSON defs file and print the flattened schemas.
    Resolve {
        /// JSON file containing the defs.
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Pin a cell on a running daemon and print its full state.
    Pin {
        /// Unix socket of the daemon.
        #[arg(long, env = "ARCHOST_SOCKET", default_value = "/tmp/archost.sock")]
        socket: PathBuf,
        /// JSON defs file registered before pinning.
        #[arg(long, value_name = "FILE")]
        defs: PathBuf,
        /// Data model URI of the schema to pin with.
        #[arg(long)]
        data_model: String,
        /// URI to pin.
        uri: String,
        /// Login name.
        #[arg(long, default_value = "archost")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref()).await?;
    match cli.command {
        Commands::Daemon {
            socket,
            docs,
            app_uri,
        } => daemon(config, socket, docs, app_uri).await?,
        Commands::Resolve { file } => resolve(config, file).await?,
        Commands::Pin {
            socket,
            defs,
            data_model,
            uri,
            user,
        } => pin(socket, defs, data_model, uri, user).await?,
    }
    Ok(())
}

async fn daemon(
    config: HostConfig,
    socket: PathBuf,
    docs: Option<PathBuf>,
    app_uri: String,
) -> anyhow::Result<()> {
    let host = Host::new(config)?;
    host.start()?;

    let app = Arc::new(MemoryApp::new(
        app_uri,
        [DEFAULT_APP_FOR_DATA_MODEL],
        host.host_planet().clone(),
    ));
    if let Some(path) = docs {
        let count = load_docs(&app, &path).await?;
        info!(docs = count, "loaded documents from {}", path.display());
    }
    host.register_app(app)?;

    let ipc = Arc::new(UnixIpc::bind(&socket, host.clone()).await?);
    let accept = ipc.start();
    info!("archost daemon started");

    tokio::signal::ctrl_c().await?;
    info!("interrupted; shutting down");
    host.stop(host.config().graceful_shutdown()).await;
    accept.await?;
    let _ = tokio::fs::remove_file(&socket).await;
    Ok(())
}

async fn resolve(config: HostConfig, path: PathBuf) -> anyhow::Result<()> {
    let mut defs = load_defs(&path).await?;
    let ctx = Lifecycle::root("resolve");
    let planet = Planet::new(PlanetId(config.home_planet_id), ctx, &config);
    planet
        .registry()
        .resolve_and_register(&mut defs)
        .with_context(|| format!("resolving {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&defs)?);
    Ok(())
}

async fn pin(
    socket: PathBuf,
    defs_path: PathBuf,
    data_model: String,
    uri: String,
    user: String,
) -> anyhow::Result<()> {
    let defs = load_defs(&defs_path).await?;
    let mut conn = ClientConn::connect(&socket).await?;

    conn.send(&Msg::new(MsgOp::Login).with_value(Value::Text(user)))
        .await?;
    expect_reply(conn.expect_batch().await?.msgs.into_iter().next(), MsgOp::Login)?;

    conn.send(
        &Msg::new(MsgOp::ResolveAndRegister)
            .with_req(1)
            .with_value(Value::Defs(defs)),
    )
    .await?;
    let reply = expect_reply(
        conn.expect_batch().await?.msgs.into_iter().next(),
        MsgOp::ResolveAndRegister,
    )?;
    let Value::Defs(resolved) = reply.value else {
        bail!("register reply carried no defs");
    };
    let schema = resolved
        .schemas
        .iter()
        .find(|s| s.data_model_uri == data_model)
        .with_context(|| format!("no schema for data model {data_model}"))?;

    conn.send(
        &Msg::new(MsgOp::PinCell)
            .with_req(2)
            .with_value(Value::Pin(PinRequest {
                pin_uri: uri,
                schema_id: schema.schema_id,
                ..PinRequest::default()
            })),
    )
    .await?;

    let names: BTreeMap<_, _> = schema
        .attrs
        .iter()
        .map(|a| (a.attr_id, a.name.as_str()))
        .collect();
    let mut state = serde_json::Map::new();
    loop {
        let batch = conn.expect_batch().await?;
        for msg in batch.msgs {
            match msg.op {
                MsgOp::PushAttr => {
                    let name = names.get(&msg.attr_id).copied().unwrap_or("?");
                    state.insert(name.to_string(), value_to_json(msg.value));
                }
                MsgOp::Checkpoint => {
                    println!("{}", serde_json::Value::Object(state));
                    return Ok(());
                }
                MsgOp::ReqDiscarded => bail!("pin failed: {}", error_text(&msg.value)),
                _ => {}
            }
        }
    }
}

fn expect_reply(msg: Option<Msg>, op: MsgOp) -> anyhow::Result<Msg> {
    let msg = msg.context("empty reply")?;
    if msg.op == MsgOp::ReqDiscarded {
        bail!("{op:?} failed: {}", error_text(&msg.value));
    }
    if msg.op != op {
        bail!("expected {op:?} reply, got {:?}", msg.op);
    }
    Ok(msg)
}

fn error_text(value: &Value) -> &str {
    match value {
        Value::Error(text) => text,
        _ => "unknown error",
    }
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<HostConfig> {
    let Some(path) = path else {
        return Ok(HostConfig::default());
    };
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(HostConfig::from_json(&data)?)
}

async fn load_defs(path: &Path) -> anyhow::Result<Defs> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_slice(&data)?)
}

async fn load_docs(app: &MemoryApp, path: &Path) -> anyhow::Result<usize> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let docs: BTreeMap<String, serde_json::Map<String, serde_json::Value>> =
        serde_json::from_slice(&data)?;
    let count = docs.len();
    for (uri, attrs) in docs {
        let attrs = attrs
            .into_iter()
            .map(|(name, value)| AttrValue::new(name, json_to_value(value)))
            .collect();
        app.put_doc(uri, attrs).await;
    }
    Ok(count)
}

fn json_to_value(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Int(b.into()),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::Text(s),
        other => Value::Text(other.to_string()),
    }
}

fn value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Text(s) => s.into(),
        Value::Int(i) => i.into(),
        Value::Float(f) => f.into(),
        Value::Bytes(b) => b.into(),
        Value::CellRef(id) => id.0.into(),
        Value::Error(e) => e.into(),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}
