//! HA Storage Gateway
//!
//! Command line front end for managing highly available iSCSI targets, NFS
//! exports and NVMe-oF subsystems, and for serving the same operations over
//! a REST API.

use anyhow::Context as _;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ha_storage_gateway::controlplane::backends::DEFAULT_CONTROLLER;
use ha_storage_gateway::controlplane::DEFAULT_API_ADDR;
use ha_storage_gateway::domain::model::{
    parse_size_kib, CLUSTER_PRIVATE_VOLUME_NUMBER, DEFAULT_RESOURCE_GROUP,
};
use ha_storage_gateway::{
    ApiServer, ApiServerConfig, Endpoint, Error, Gateway, GatewayConfig, Iqn, IscsiTarget,
    LinstorConfig, NfsExport, Nqn, NvmeSubsystem, Reconciler, ResourceState, ServiceIp,
    VolumeConfig, WaitConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// HA Storage Gateway - highly available iSCSI, NFS and NVMe-oF endpoints
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Comma separated list of storage controllers to try
    #[arg(long, env = "LS_CONTROLLERS", default_value = DEFAULT_CONTROLLER, global = true)]
    controllers: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    /// Run against a simulated in-process cluster
    #[arg(long, env = "STANDALONE", global = true)]
    standalone: bool,

    /// Seconds to wait for a resource to start or stop
    #[arg(
        long,
        env = "GATEWAY_WAIT_TIMEOUT",
        default_value = "30",
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    wait_timeout: u64,

    /// Milliseconds between state polls while waiting
    #[arg(
        long,
        env = "GATEWAY_POLL_INTERVAL",
        default_value = "1000",
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    poll_interval: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage iSCSI targets
    Iscsi {
        #[command(subcommand)]
        command: IscsiCommand,
    },
    /// Manage NFS exports
    Nfs {
        #[command(subcommand)]
        command: NfsCommand,
    },
    /// Manage NVMe-oF subsystems
    Nvme {
        #[command(subcommand)]
        command: NvmeCommand,
    },
    /// Serve the REST API
    Server {
        /// REST API bind address
        #[arg(long, env = "API_ADDR", default_value = DEFAULT_API_ADDR)]
        addr: String,
    },
}

/// Options shared by every `create` subcommand
#[derive(ClapArgs, Debug)]
struct CreateOptions {
    /// Resource group to place the volumes with
    #[arg(long, default_value = DEFAULT_RESOURCE_GROUP)]
    resource_group: String,

    /// Interpret sizes as the gross size including replication metadata
    #[arg(long)]
    gross: bool,
}

#[derive(Subcommand, Debug)]
enum IscsiCommand {
    /// Create an iSCSI target
    Create {
        /// Target IQN, e.g. iqn.2019-08.com.example:target1
        iqn: String,
        /// Service IPs with prefix length, comma separated
        service_ips: String,
        /// One size per volume (e.g. 1G), numbered from 1
        #[arg(required = true)]
        sizes: Vec<String>,
        #[arg(short, long, default_value = "")]
        username: String,
        #[arg(short, long, default_value = "")]
        password: String,
        /// Initiators allowed to log in
        #[arg(long = "allowed-initiator")]
        allowed_initiators: Vec<String>,
        #[command(flatten)]
        options: CreateOptions,
    },
    #[command(flatten)]
    Common(CommonCommand),
}

#[derive(Subcommand, Debug)]
enum NfsCommand {
    /// Create an NFS export
    Create {
        /// Export name
        name: String,
        /// Service IP with prefix length
        service_ip: String,
        /// One size per volume (e.g. 1G), numbered from 1
        #[arg(required = true)]
        sizes: Vec<String>,
        /// Path below the export root
        #[arg(long, default_value = "")]
        export_path: String,
        /// Networks allowed to mount the export
        #[arg(long = "allowed-ips", value_delimiter = ',')]
        allowed_ips: Vec<String>,
        #[command(flatten)]
        options: CreateOptions,
    },
    #[command(flatten)]
    Common(CommonCommand),
}

#[derive(Subcommand, Debug)]
enum NvmeCommand {
    /// Create an NVMe-oF subsystem
    Create {
        /// Subsystem NQN, e.g. nqn.2021-08.com.example:nvme:vol1
        nqn: String,
        /// Service IPs with prefix length, comma separated
        service_ips: String,
        /// One size per volume (e.g. 1G), numbered from 1
        #[arg(required = true)]
        sizes: Vec<String>,
        /// Transport service port
        #[arg(long, default_value = "4420")]
        port: u16,
        #[command(flatten)]
        options: CreateOptions,
    },
    #[command(flatten)]
    Common(CommonCommand),
}

#[derive(Subcommand, Debug)]
enum CommonCommand {
    /// List all endpoints of this type
    List {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Start one or more endpoints
    Start {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Stop one or more endpoints
    Stop {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Delete one or more endpoints
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Add a volume to a stopped endpoint
    AddVolume {
        id: String,
        number: u32,
        size: String,
        #[arg(long)]
        file_system: Option<String>,
    },
    /// Delete a volume from a stopped endpoint
    DeleteVolume { id: String, number: u32 },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(&args);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling pending operations");
                cancel.cancel();
            }
        }
    });

    match run(args, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(errors) => {
            for e in &errors {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::from(exit_code(&errors))
        }
    }
}

async fn run(args: Args, cancel: CancellationToken) -> Result<(), Vec<anyhow::Error>> {
    let config = GatewayConfig {
        linstor: LinstorConfig::from_controller_list(&args.controllers),
        wait: WaitConfig {
            timeout: Duration::from_secs(args.wait_timeout),
            interval: Duration::from_millis(args.poll_interval),
        },
        standalone: args.standalone,
    };

    let gateway = Gateway::connect(&config, cancel.clone())
        .await
        .context("failed to initialize gateway")
        .map_err(|e| vec![e])?;

    match args.command {
        Command::Iscsi { command } => match command {
            IscsiCommand::Create {
                iqn,
                service_ips,
                sizes,
                username,
                password,
                allowed_initiators,
                options,
            } => {
                let build = || -> ha_storage_gateway::Result<IscsiTarget> {
                    let mut target = IscsiTarget::new(
                        iqn.parse::<Iqn>()?,
                        parse_ips(service_ips.split(','))?,
                        volumes_from_sizes(&sizes)?,
                    );
                    target.username = username.clone();
                    target.password = password.clone();
                    target.allowed_initiators = allowed_initiators
                        .iter()
                        .map(|i| i.parse::<Iqn>())
                        .collect::<ha_storage_gateway::Result<_>>()?;
                    target.resource_group = options.resource_group.clone();
                    target.gross_size = options.gross;
                    Ok(target)
                };
                create(&gateway.iscsi, build()).await
            }
            IscsiCommand::Common(common) => run_common(&gateway.iscsi, common).await,
        },
        Command::Nfs { command } => match command {
            NfsCommand::Create {
                name,
                service_ip,
                sizes,
                export_path,
                allowed_ips,
                options,
            } => {
                let build = || -> ha_storage_gateway::Result<NfsExport> {
                    let mut export = NfsExport::new(
                        name.clone(),
                        service_ip.parse::<ServiceIp>()?,
                        volumes_from_sizes(&sizes)?,
                    );
                    export.export_path = export_path.clone();
                    export.allowed_ips = parse_ips(allowed_ips.iter().map(String::as_str))?;
                    export.resource_group = options.resource_group.clone();
                    export.gross_size = options.gross;
                    Ok(export)
                };
                create(&gateway.nfs, build()).await
            }
            NfsCommand::Common(common) => run_common(&gateway.nfs, common).await,
        },
        Command::Nvme { command } => match command {
            NvmeCommand::Create {
                nqn,
                service_ips,
                sizes,
                port,
                options,
            } => {
                let build = || -> ha_storage_gateway::Result<NvmeSubsystem> {
                    let mut subsystem = NvmeSubsystem::new(
                        nqn.parse::<Nqn>()?,
                        parse_ips(service_ips.split(','))?,
                        volumes_from_sizes(&sizes)?,
                    );
                    subsystem.port = port;
                    subsystem.resource_group = options.resource_group.clone();
                    subsystem.gross_size = options.gross;
                    Ok(subsystem)
                };
                create(&gateway.nvmeof, build()).await
            }
            NvmeCommand::Common(common) => run_common(&gateway.nvmeof, common).await,
        },
        Command::Server { addr } => {
            let rest_addr = addr
                .parse::<std::net::SocketAddr>()
                .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))
                .map_err(|e| vec![anyhow::Error::from(e)])?;

            info!("Starting HA storage gateway {}", ha_storage_gateway::VERSION);
            info!("  REST API: {}", rest_addr);
            info!("  Standalone mode: {}", config.standalone);

            let server = ApiServer::new(ApiServerConfig { rest_addr }, gateway, cancel);
            server.run().await.map_err(|e| vec![anyhow::Error::from(e)])?;

            info!("Gateway shutdown complete");
            Ok(())
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn create<E: Endpoint>(
    reconciler: &Reconciler<E>,
    requested: ha_storage_gateway::Result<E>,
) -> Result<(), Vec<anyhow::Error>> {
    let requested = requested.map_err(|e| vec![anyhow::Error::from(e)])?;
    let id = requested.id().clone();
    let created = reconciler
        .create(requested)
        .await
        .with_context(|| format!("failed to create {} {}", E::PROTOCOL, id))
        .map_err(|e| vec![e])?;
    println!(
        "Created {} {} ({})",
        E::PROTOCOL,
        created.id(),
        created.status().service
    );
    Ok(())
}

async fn run_common<E: Endpoint>(
    reconciler: &Reconciler<E>,
    command: CommonCommand,
) -> Result<(), Vec<anyhow::Error>> {
    match command {
        CommonCommand::List { output } => {
            let endpoints = reconciler
                .list()
                .await
                .with_context(|| format!("failed to list {} endpoints", E::PROTOCOL))
                .map_err(|e| vec![e])?;
            print_list(&endpoints, output).map_err(|e| vec![e])
        }
        CommonCommand::Start { ids } => {
            for_each_target::<E, _, _>(&ids, "start", |id| async move {
                reconciler.start(&id).await?.ok_or_else(|| missing::<E>(&id))?;
                println!("Started {} {}", E::PROTOCOL, id);
                Ok::<(), Error>(())
            })
            .await
        }
        CommonCommand::Stop { ids } => {
            for_each_target::<E, _, _>(&ids, "stop", |id| async move {
                reconciler.stop(&id).await?.ok_or_else(|| missing::<E>(&id))?;
                println!("Stopped {} {}", E::PROTOCOL, id);
                Ok::<(), Error>(())
            })
            .await
        }
        CommonCommand::Delete { ids } => {
            for_each_target::<E, _, _>(&ids, "delete", |id| async move {
                reconciler.delete(&id).await?;
                println!("Deleted {} {}", E::PROTOCOL, id);
                Ok::<(), Error>(())
            })
            .await
        }
        CommonCommand::AddVolume {
            id,
            number,
            size,
            file_system,
        } => {
            add_volume(reconciler, &id, number, &size, file_system)
                .await
                .with_context(|| format!("failed to add volume {} to {}", number, id))
                .map_err(|e| vec![e])?;
            println!("Added volume {} to {} {}", number, E::PROTOCOL, id);
            Ok(())
        }
        CommonCommand::DeleteVolume { id, number } => {
            delete_volume(reconciler, &id, number)
                .await
                .with_context(|| format!("failed to delete volume {} of {}", number, id))
                .map_err(|e| vec![e])?;
            println!("Deleted volume {} of {} {}", number, E::PROTOCOL, id);
            Ok(())
        }
    }
}

async fn add_volume<E: Endpoint>(
    reconciler: &Reconciler<E>,
    raw: &str,
    number: u32,
    size: &str,
    file_system: Option<String>,
) -> ha_storage_gateway::Result<E> {
    let id = E::parse_id(raw)?;
    let mut volume = VolumeConfig::new(number, parse_size_kib(size)?);
    volume.file_system = file_system;
    reconciler
        .add_volume(&id, volume)
        .await?
        .ok_or_else(|| missing::<E>(&id))
}

async fn delete_volume<E: Endpoint>(
    reconciler: &Reconciler<E>,
    raw: &str,
    number: u32,
) -> ha_storage_gateway::Result<E> {
    let id = E::parse_id(raw)?;
    reconciler
        .delete_volume(&id, number)
        .await?
        .ok_or_else(|| missing::<E>(&id))
}

/// Run `op` for every identity, collecting all failures instead of stopping
/// at the first one
async fn for_each_target<E, F, Fut>(
    ids: &[String],
    verb: &str,
    op: F,
) -> Result<(), Vec<anyhow::Error>>
where
    E: Endpoint,
    F: Fn(E::Id) -> Fut,
    Fut: std::future::Future<Output = ha_storage_gateway::Result<()>>,
{
    let mut errors = Vec::new();
    for raw in ids {
        let result = match E::parse_id(raw) {
            Ok(id) => op(id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Failed to {} {} {}: {}", verb, E::PROTOCOL, raw, e);
            errors.push(anyhow::Error::from(e).context(format!("failed to {} {}", verb, raw)));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn missing<E: Endpoint>(id: &E::Id) -> Error {
    Error::not_found(E::PROTOCOL, id.to_string())
}

// =============================================================================
// Output
// =============================================================================

fn print_list<E: Endpoint>(endpoints: &[E], output: OutputFormat) -> anyhow::Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(endpoints)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(endpoints)?),
        OutputFormat::Table => {
            print!("{}", render_table(endpoints));
            if degraded_volumes(endpoints) > 0 {
                warn!(
                    "Some resources are degraded. Run `linstor advise resource` for possible solutions."
                );
            }
        }
    }
    Ok(())
}

fn degraded_volumes<E: Endpoint>(endpoints: &[E]) -> usize {
    endpoints
        .iter()
        .flat_map(|e| e.status().volumes.iter())
        .filter(|v| v.number != CLUSTER_PRIVATE_VOLUME_NUMBER)
        .filter(|v| v.state == ResourceState::Degraded)
        .count()
}

/// Plain text table, one row per user-visible volume
fn render_table<E: Endpoint>(endpoints: &[E]) -> String {
    let mut rows = vec![[
        E::PROTOCOL.to_string(),
        "Volume".to_string(),
        "Size".to_string(),
        "Service".to_string(),
        "Primary".to_string(),
        "State".to_string(),
    ]];

    for endpoint in endpoints {
        let status = endpoint.status();
        let visible = endpoint
            .volumes()
            .iter()
            .filter(|v| v.number != CLUSTER_PRIVATE_VOLUME_NUMBER);
        for volume in visible {
            let state = status
                .volumes
                .iter()
                .find(|v| v.number == volume.number)
                .map(|v| v.state.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            rows.push([
                endpoint.id().to_string(),
                volume.number.to_string(),
                format_size(volume.size_kib),
                status.service.to_string(),
                status.primary.clone().unwrap_or_default(),
                state,
            ]);
        }
    }

    let mut widths = [0usize; 6];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    for row in &rows {
        let line = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn format_size(kib: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    let mut value = kib;
    let mut unit = 0;
    while unit + 1 < UNITS.len() && value >= 1024 && value % 1024 == 0 {
        value /= 1024;
        unit += 1;
    }
    format!("{}{}", value, UNITS[unit])
}

// =============================================================================
// Argument Helpers
// =============================================================================

fn parse_ips<'a>(
    raw: impl Iterator<Item = &'a str>,
) -> ha_storage_gateway::Result<Vec<ServiceIp>> {
    raw.map(|ip| ip.trim().parse()).collect()
}

fn volumes_from_sizes(sizes: &[String]) -> ha_storage_gateway::Result<Vec<VolumeConfig>> {
    sizes
        .iter()
        .zip(1u32..)
        .map(|(size, number)| Ok(VolumeConfig::new(number, parse_size_kib(size)?)))
        .collect()
}

fn exit_code(errors: &[anyhow::Error]) -> u8 {
    errors
        .iter()
        .find_map(|e| e.downcast_ref::<Error>())
        .map(|e| e.exit_code() as u8)
        .unwrap_or(1)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use ha_storage_gateway::{ResourceStatus, ServiceState, VolumeStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GIB: u64 = 1024 * 1024;

    fn export(volumes: &[(u32, ResourceState)]) -> NfsExport {
        let mut e = NfsExport::new(
            "export1",
            "192.168.1.5/24".parse().unwrap(),
            volumes.iter().map(|(n, _)| VolumeConfig::new(*n, 2 * GIB)).collect(),
        );
        e.status = ResourceStatus {
            service: ServiceState::Started,
            primary: Some("node-a".into()),
            nodes: vec!["node-a".into(), "node-b".into()],
            volumes: volumes
                .iter()
                .map(|(number, state)| VolumeStatus {
                    number: *number,
                    state: *state,
                })
                .collect(),
        };
        e
    }

    #[tokio::test]
    async fn test_for_each_target_runs_every_target() {
        let calls = AtomicUsize::new(0);
        let ids: Vec<String> = ["export1", "1bad", "export2", "export3"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let result = for_each_target::<NfsExport, _, _>(&ids, "stop", |id| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if id == "export2" {
                    Err(Error::Conflict("busy".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        // the unparsable identity never reaches the operation
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("failed to stop 1bad"));
        assert!(errors[1].to_string().contains("failed to stop export2"));
        assert_eq!(exit_code(&errors), 2);
    }

    #[tokio::test]
    async fn test_for_each_target_succeeds_when_all_do() {
        let ids = vec!["export1".to_string(), "export2".to_string()];
        let result =
            for_each_target::<NfsExport, _, _>(&ids, "start", |_| async { Ok(()) }).await;
        tokio_test::assert_ok!(result);
    }

    #[test]
    fn test_exit_code_defaults_to_one() {
        assert_eq!(exit_code(&[anyhow::anyhow!("plain failure")]), 1);
        assert_eq!(
            exit_code(&[anyhow::Error::from(Error::not_found("NFS", "x"))]),
            4
        );
    }

    #[test]
    fn test_render_table_hides_cluster_private_volume() {
        let mut e = export(&[(1, ResourceState::Ok), (2, ResourceState::Degraded)]);
        e.volumes.insert(0, VolumeConfig::new(0, 64 * 1024));
        e.status.volumes.insert(
            0,
            VolumeStatus {
                number: 0,
                state: ResourceState::Ok,
            },
        );

        let table = render_table(&[e]);
        let rows: Vec<&str> = table.lines().collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with("NFS"));
        assert_eq!(
            rows[1].split_whitespace().collect::<Vec<_>>(),
            vec!["export1", "1", "2GiB", "started", "node-a", "ok"]
        );
        assert!(rows[2].ends_with("degraded"));
        assert!(rows.iter().all(|r| r.split_whitespace().nth(1) != Some("0")));
    }

    #[test]
    fn test_degraded_volumes() {
        assert_eq!(degraded_volumes(&[export(&[(1, ResourceState::Ok)])]), 0);
        assert_eq!(
            degraded_volumes(&[
                export(&[(1, ResourceState::Degraded), (2, ResourceState::Ok)]),
                export(&[(1, ResourceState::Degraded)]),
            ]),
            2
        );
        assert_eq!(degraded_volumes::<NfsExport>(&[]), 0);
    }

    #[test]
    fn test_zero_wait_timings_rejected() {
        let err = Args::try_parse_from(["ha-storage-gateway", "--poll-interval", "0", "server"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let args =
            Args::try_parse_from(["ha-storage-gateway", "--poll-interval", "5", "server"]).unwrap();
        assert_eq!(args.poll_interval, 5);
    }

    #[test]
    fn test_argument_helpers() {
        let ips = parse_ips("10.0.0.1/24, 10.0.0.2/24".split(',')).unwrap();
        assert_eq!(ips.len(), 2);
        assert_matches!(parse_ips(["10.0.0.1"].into_iter()), Err(Error::Validation(_)));

        let volumes = volumes_from_sizes(&["1G".to_string(), "512M".to_string()]).unwrap();
        assert_eq!(volumes[0].number, 1);
        assert_eq!(volumes[1].number, 2);
        assert_eq!(format_size(GIB), "1GiB");
        assert_eq!(format_size(1536), "1536KiB");
    }
}
