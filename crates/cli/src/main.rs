use clap::{Parser, Subcommand};

const GUIDE: &str = r#"Guide:

1. Create a client on the notification server and put its token into the client_token option
   (or export HOOKRELAY_CLIENT_TOKEN).
2. Update the host_server option if it differs from the default 'ws://localhost'.
3. Configure webhooks.

Webhook example:

client_token: CHANGE_ME
host_server: ws://localhost
web_hooks:
  - url: http://example.com/api/messages
    body: "{{title}}\n\n{{message}}"
  - url: http://192.168.1.2:10201/api/sendTextMsg
    apps:
      - 1
    method: POST
    header:
      Content-Type: application/json
    body: "{\"wxid\":\"xxxxxxxx\",\"msg\":\"{{title}}\n{{message}}\"}"

Bodies that parse as JSON have each string value rendered on its own and are re-encoded;
anything else is rendered as plain text. `apps` limits a webhook to those application ids.

Note: restart `hookrelay run` after making changes.
"#;

#[derive(Parser)]
#[command(name = "hookrelay")]
#[command(about = "Forward stream notifications to webhooks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a default configuration file if none exists.
    Init {
        /// Config file path (default: HOOKRELAY_CONFIG_PATH or ~/.hookrelay/config.yaml)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Load and validate the configuration, then list the webhook destinations.
    Check {
        /// Config file path (default: HOOKRELAY_CONFIG_PATH or ~/.hookrelay/config.yaml)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Print configuration help with an example.
    Guide,

    /// Connect to the stream and forward every notification until Ctrl+C.
    Run {
        /// Config file path (default: HOOKRELAY_CONFIG_PATH or ~/.hookrelay/config.yaml)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Override host_server from the config file.
        #[arg(long, value_name = "URL")]
        host: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            let info = lib::bridge::plugin_info();
            println!("{} {} - {}", info.name, info.version, info.description);
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Check { config }) => {
            if let Err(e) = run_check(config) {
                log::error!("check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Guide) => {
            print!("{}", GUIDE);
        }
        Some(Commands::Run { config, host }) => {
            if let Err(e) = run_bridge(config, host).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    if lib::config::write_default_config(&path)? {
        println!("initialized configuration at {}", path.display());
    } else {
        println!("configuration already exists at {}", path.display());
    }
    Ok(())
}

fn run_check(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    let settings = config.validate()?;
    println!("config {} is valid", path.display());
    println!("stream: {}", settings.stream_url);
    for d in settings.destinations.iter() {
        let apps = if d.apps.is_empty() {
            "all apps".to_string()
        } else {
            format!("apps {:?}", d.apps)
        };
        println!("webhook: {} {} ({})", d.method, d.url, apps);
    }
    Ok(())
}

async fn run_bridge(
    config_path: Option<std::path::PathBuf>,
    host: Option<String>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(h) = host {
        config.host_server = h;
    }
    let bridge = lib::Bridge::new(&config)?;
    log::info!(
        "loaded {} webhook(s) from {}",
        bridge.settings().await.destinations.len(),
        path.display()
    );
    bridge.enable().await;
    shutdown_signal().await;
    log::info!("shutdown signal received, closing stream");
    bridge.disable().await;
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
