//! modular-xmpp CLI: inspect the connection state graph and simulate
//! connections against the in-memory mock server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use modular_xmpp_compression::{CompressionModuleDescriptor, COMPRESS_FEATURE_NAMESPACE, ZLIB};
use modular_xmpp_fsm::mock::{
    post_auth_features, MockServerScript, MockSession, MockTransportModuleDescriptor,
};
use modular_xmpp_fsm::stats::{PlainText, Toml};
use modular_xmpp_fsm::{
    ConnectionConfig, ConnectionConfiguration, ConnectionStateEvent, ModularConnection,
};
use modular_xmpp_types::{LoginContext, Stanza, StanzaKind, StreamFeature, TopLevelElement};

const DEFAULT_USERNAME: &str = "juliet";
const DEFAULT_PASSWORD: &str = "r0m30";

#[derive(Parser)]
#[command(
    name = "modular-xmpp",
    about = "Inspect and simulate modular XMPP client connections",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the connection state graph in Graphviz DOT format.
    Graph {
        /// Leave out the compression module.
        #[arg(long)]
        no_compression: bool,

        /// Put state references on their own line.
        #[arg(long)]
        break_names: bool,
    },

    /// Connect, log in and disconnect against the mock server, logging
    /// every state machine event.
    Simulate {
        /// Log in with a wrong password.
        #[arg(long)]
        fail_auth: bool,

        /// Disconnect without closing the stream.
        #[arg(long)]
        instant: bool,
    },

    /// Run a simulated session and print its statistics.
    Stats {
        #[arg(short, long, value_enum, default_value_t = StatsOutput::Plain)]
        format: StatsOutput,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatsOutput {
    Plain,
    Toml,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.connection.log_level)),
        )
        .init();

    match cli.command {
        Commands::Graph {
            no_compression,
            break_names,
        } => {
            let mut builder = ConnectionConfiguration::builder(config)
                .add_module(MockTransportModuleDescriptor::default());
            if !no_compression {
                builder = builder.add_module(CompressionModuleDescriptor::default());
            }
            let configuration = builder.build()?;
            println!(
                "{}",
                configuration.state_descriptor_graph().to_dot(break_names)
            );
        }
        Commands::Simulate { fail_auth, instant } => {
            let connection = simulated_connection(config)?;
            let id = connection.add_state_machine_listener(Arc::new(log_event));

            let result = simulate(&connection, fail_auth, instant).await;
            connection.remove_state_machine_listener(id);
            result?;
            println!("{}", connection.stats());
        }
        Commands::Stats { format } => {
            let connection = simulated_connection(config)?;
            simulate(&connection, false, false).await?;
            let stats = connection.stats();
            match format {
                StatsOutput::Plain => println!("{}", stats.render(&PlainText)),
                StatsOutput::Toml => println!("{}", stats.render(&Toml)),
            }
        }
    }

    Ok(())
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("modular-xmpp")
        .join("config.toml")
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ConnectionConfig> {
    if let Some(path) = path {
        return ConnectionConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    let path = default_config_path();
    if path.exists() {
        return ConnectionConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    Ok(ConnectionConfig::default())
}

fn simulated_connection(config: ConnectionConfig) -> anyhow::Result<ModularConnection> {
    let username = config
        .login
        .username
        .clone()
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
    let password = config
        .login
        .password
        .clone()
        .unwrap_or_else(|| DEFAULT_PASSWORD.to_string());

    let mut script = MockServerScript::default();
    let mut features = post_auth_features();
    features.insert(StreamFeature::new("compression", COMPRESS_FEATURE_NAMESPACE).with_value(ZLIB));
    script.stream_features = vec![script.stream_features[0].clone(), features];

    let configuration = ConnectionConfiguration::builder(config)
        .add_module(MockTransportModuleDescriptor::new(script))
        .add_module(CompressionModuleDescriptor::default())
        .build()?;
    let session = Arc::new(MockSession::new(username, password));
    Ok(ModularConnection::new(configuration, session)?)
}

async fn simulate(
    connection: &ModularConnection,
    fail_auth: bool,
    instant: bool,
) -> anyhow::Result<()> {
    let config = connection.configuration().config();
    let mut login = config
        .login
        .login_context()?
        .unwrap_or_else(|| LoginContext::new(DEFAULT_USERNAME, DEFAULT_PASSWORD));
    if fail_auth {
        login.password = format!("not-{}", login.password);
    }

    connection.connect().await.context("connect failed")?;
    tracing::info!(state = %connection.current_state(), "connected");

    match connection.login(login).await {
        Ok(()) => {
            tracing::info!(
                resource = ?connection.bound_resource().map(|r| r.to_string()),
                compressed = connection.is_using_compression(),
                "logged in"
            );
            let presence = Stanza::new(StanzaKind::Presence, "");
            connection.send(TopLevelElement::Stanza(presence)).await?;
        }
        Err(e) => tracing::warn!(error = %e, state = %connection.current_state(), "login failed"),
    }

    if instant {
        connection.instant_shutdown().await?;
    } else {
        connection.disconnect().await?;
    }
    tracing::info!(state = %connection.current_state(), "disconnected");
    Ok(())
}

fn log_event(event: &ConnectionStateEvent) {
    match event {
        ConnectionStateEvent::TransitionFailed { .. }
        | ConnectionStateEvent::EndpointLookupFailed { .. } => tracing::warn!("{event}"),
        ConnectionStateEvent::TransitionNotPossible { .. }
        | ConnectionStateEvent::TransitionIgnoredDueCycle { .. } => tracing::debug!("{event}"),
        _ => tracing::info!("{event}"),
    }
}
