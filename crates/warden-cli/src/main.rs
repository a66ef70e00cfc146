//! warden: command-line client for a warden container server.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use warden_bridge::backend::{ContainerSpec, MemoryLimits, ProcessSpec, Properties};
use warden_bridge::client::{Connection, ConnectionConfig, OutputMode, ProcessIo, parse_env};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Server address as host:port.
    #[arg(short, long, default_value = "127.0.0.1:7777", env = "WARDEN_ADDRESS")]
    address: String,

    /// Connect timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    dial_timeout: u64,

    /// Deliver process output as frames on the process connection.
    #[arg(long)]
    inline_output: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Check that the server is reachable.
    Ping,

    /// Show the server's resource capacity.
    Capacity,

    /// Create a container and print its handle.
    Create {
        /// Requested handle (server-assigned when omitted).
        #[arg(long, default_value = "")]
        handle: String,
        /// Idle seconds before the container is destroyed (server default when omitted).
        #[arg(long)]
        grace_time: Option<u64>,
        #[arg(long, default_value = "")]
        rootfs: String,
        #[arg(long, default_value = "")]
        network: String,
        /// Properties in key=value format (repeatable).
        #[arg(long = "property")]
        properties: Vec<String>,
        /// Environment in KEY=VALUE format (repeatable).
        #[arg(long = "env")]
        env: Vec<String>,
    },

    /// Destroy a container.
    Destroy { handle: String },

    /// List container handles, optionally filtered by property.
    List {
        /// Properties in key=value format (repeatable).
        #[arg(long = "property")]
        properties: Vec<String>,
    },

    /// Show container state and statistics.
    Info { handle: String },

    /// Run a script in a container, forwarding stdin and output.
    Run {
        handle: String,
        script: String,
        /// Environment in KEY=VALUE format (repeatable).
        #[arg(long = "env")]
        env: Vec<String>,
        #[arg(long)]
        privileged: bool,
        /// Forward this terminal's stdin to the process.
        #[arg(short, long)]
        interactive: bool,
    },

    /// Upload a tar stream from stdin into the container.
    StreamIn {
        handle: String,
        #[arg(long)]
        destination: String,
    },

    /// Download a path from the container as a tar stream on stdout.
    StreamOut {
        handle: String,
        #[arg(long)]
        source: String,
    },

    /// Print one container property.
    GetProperty { handle: String, key: String },

    /// Set one container property.
    SetProperty {
        handle: String,
        key: String,
        value: String,
    },

    /// Show or set the memory limit.
    LimitMemory {
        handle: String,
        /// New limit; only the current limit is shown when omitted.
        #[arg(long)]
        limit_in_bytes: Option<u64>,
    },
}

/// Initialize tracing with WARDEN_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("WARDEN_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("warden={level},warden_bridge={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_properties(entries: &[String]) -> Result<Properties> {
    let mut properties = HashMap::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid property '{entry}': expected key=value");
        };
        properties.insert(key.to_string(), value.to_string());
    }
    Ok(properties)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let output_mode = if cli.inline_output {
        OutputMode::Inline
    } else {
        OutputMode::Auxiliary
    };
    let config = ConnectionConfig::new(cli.address.clone())
        .with_dial_timeout(Duration::from_millis(cli.dial_timeout))
        .with_output_mode(output_mode);
    let client = Connection::new(config).context("configure client")?;

    match cli.command {
        Cmd::Ping => {
            client.ping().await.context("ping")?;
            println!("ok");
        }

        Cmd::Capacity => {
            let capacity = client.capacity().await.context("capacity")?;
            println!("{}", serde_json::to_string_pretty(&capacity)?);
        }

        Cmd::Create {
            handle,
            grace_time,
            rootfs,
            network,
            properties,
            env,
        } => {
            let spec = ContainerSpec {
                handle,
                grace_time: Duration::from_secs(grace_time.unwrap_or_default()),
                rootfs_path: rootfs,
                network,
                properties: parse_properties(&properties)?,
                env: parse_env(&env)?,
                ..ContainerSpec::default()
            };
            let handle = client.create(spec).await.context("create container")?;
            println!("{handle}");
        }

        Cmd::Destroy { handle } => {
            client.destroy(&handle).await.context("destroy container")?;
        }

        Cmd::List { properties } => {
            let filter = parse_properties(&properties)?;
            for handle in client.list(&filter).await.context("list containers")? {
                println!("{handle}");
            }
        }

        Cmd::Info { handle } => {
            let info = client.info(&handle).await.context("container info")?;
            println!("State:          {}", info.state);
            println!("Container IP:   {}", info.container_ip);
            println!("Host IP:        {}", info.host_ip);
            println!("External IP:    {}", info.external_ip);
            println!("Path:           {}", info.container_path);
            println!("Processes:      {:?}", info.process_ids);
            println!("Events:         {}", info.events.join(", "));
            let mut properties: Vec<_> = info.properties.into_iter().collect();
            properties.sort();
            for (key, value) in properties {
                println!("Property:       {key}={value}");
            }
            for port in info.mapped_ports {
                println!("Port:           {} -> {}", port.host_port, port.container_port);
            }
            println!("Memory RSS:     {}", info.memory_stat.rss);
            println!("CPU usage:      {}", info.cpu_stat.usage);
            println!("Disk used:      {}", info.disk_stat.bytes_used);
        }

        Cmd::Run {
            handle,
            script,
            env,
            privileged,
            interactive,
        } => {
            let spec = ProcessSpec {
                script,
                privileged,
                env: parse_env(&env)?,
                ..ProcessSpec::default()
            };
            let mut io = ProcessIo::default()
                .with_stdout(tokio::io::stdout())
                .with_stderr(tokio::io::stderr());
            if interactive {
                io = io.with_stdin(tokio::io::stdin());
            }

            let mut process = client.run(&handle, spec, io).await.context("run process")?;
            tracing::debug!(process_id = process.id(), "Process running");
            let status = process.wait().await.context("wait for process")?;
            if status != 0 {
                std::process::exit(i32::try_from(status).unwrap_or(i32::MAX));
            }
        }

        Cmd::StreamIn {
            handle,
            destination,
        } => {
            client
                .stream_in(&handle, &destination, Box::new(tokio::io::stdin()))
                .await
                .context("stream in")?;
        }

        Cmd::StreamOut { handle, source } => {
            let mut reader = client
                .stream_out(&handle, &source)
                .await
                .context("stream out")?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
            tokio::io::AsyncWriteExt::flush(&mut stdout).await?;
        }

        Cmd::GetProperty { handle, key } => {
            let value = client
                .get_property(&handle, &key)
                .await
                .context("get property")?;
            println!("{value}");
        }

        Cmd::SetProperty { handle, key, value } => {
            client
                .set_property(&handle, &key, &value)
                .await
                .context("set property")?;
        }

        Cmd::LimitMemory {
            handle,
            limit_in_bytes,
        } => {
            let limits = match limit_in_bytes {
                Some(limit_in_bytes) => client
                    .limit_memory(&handle, MemoryLimits { limit_in_bytes })
                    .await
                    .context("limit memory")?,
                None => client
                    .current_memory_limits(&handle)
                    .await
                    .context("current memory limits")?,
            };
            println!("{}", limits.limit_in_bytes);
        }
    }

    Ok(())
}
