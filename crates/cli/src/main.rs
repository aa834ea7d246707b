use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "opsgate", about = "opsgate — admin dashboard messaging gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 18790)]
        port: u16,
    },
    /// Channel management.
    Channels {
        #[command(subcommand)]
        action: ChannelAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ChannelAction {
    /// List channels with their limits and permissions.
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration.
    Get,
    /// Print the config file path that would be used.
    Path,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn list_channels() {
    let config = opsgate_config::discover_and_load();
    let registry = opsgate_channels::ChannelRegistry::bootstrap();
    opsgate_gateway::server::apply_channel_overrides(&registry, &config.channels);
    for channel in registry.list() {
        println!(
            "{:<15} {:<6} {:>4}/min {:>5}/hr  max {:<4} roles [{}]",
            channel.name,
            if channel.active { "on" } else { "off" },
            channel.messages_per_minute,
            channel.messages_per_hour,
            channel.max_subscribers,
            channel.permissions.join(", "),
        );
    }
}

fn show_config(action: &ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get => {
            let config = opsgate_config::discover_and_load();
            println!("{}", serde_json::to_string_pretty(&config)?);
        },
        ConfigAction::Path => {
            println!(
                "{}",
                opsgate_config::loader::find_or_default_config_path().display()
            );
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "opsgate starting");

    match cli.command {
        Commands::Gateway { bind, port } => {
            opsgate_gateway::server::start_gateway(&bind, port).await
        },
        Commands::Channels {
            action: ChannelAction::List,
        } => {
            list_channels();
            Ok(())
        },
        Commands::Config { action } => show_config(&action),
    }
}
