use clap::{value_parser, Arg, Command};
use std::net::IpAddr;
use tracing::info;

use o3cache::{Config, Node, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let defaults = Config::default();
    let matches = Command::new("o3cache")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Clustered in-memory key-value cache")
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .env("NODE_ID")
                .help("Node identifier; generated when omitted"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .env("NODE_HOST")
                .default_value("127.0.0.1")
                .help("Host advertised to peers"),
        )
        .arg(
            Arg::new("bind-ip")
                .long("bind-ip")
                .env("NODE_BIND_IP")
                .default_value("0.0.0.0")
                .value_parser(value_parser!(IpAddr))
                .help("Interface to listen on"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .env("NODE_PORT")
                .default_value("7000")
                .value_parser(value_parser!(u16))
                .help("RPC port"),
        )
        .arg(
            Arg::new("api-port")
                .long("api-port")
                .env("NODE_API_PORT")
                .value_parser(value_parser!(u16))
                .help("HTTP gateway port; the gateway is off when omitted"),
        )
        .arg(
            Arg::new("buckets")
                .long("buckets")
                .env("NUMBER_OF_BUCKETS")
                .default_value("16")
                .value_parser(value_parser!(usize))
                .help("Number of buckets owned by this node"),
        )
        .arg(
            Arg::new("request-timeout-ms")
                .long("request-timeout-ms")
                .env("REQUEST_TIMEOUT_MS")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("replication-batch-size")
                .long("replication-batch-size")
                .env("REPLICATION_BATCH_SIZE")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("replication-max-retries")
                .long("replication-max-retries")
                .env("REPLICATION_MAX_RETRIES")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("max-concurrent-requests")
                .long("max-concurrent-requests")
                .env("CLIENT_POOL_SIZE")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("max-concurrent-replication")
                .long("max-concurrent-replication")
                .env("REPLICATION_POOL_SIZE")
                .value_parser(value_parser!(usize)),
        )
        .get_matches();

    let config = Config {
        node_id: matches.get_one::<String>("node-id").cloned(),
        host: matches
            .get_one::<String>("host")
            .cloned()
            .unwrap_or(defaults.host),
        bind_ip: matches
            .get_one::<IpAddr>("bind-ip")
            .copied()
            .unwrap_or(defaults.bind_ip),
        port: matches.get_one::<u16>("port").copied().unwrap_or(defaults.port),
        api_port: matches.get_one::<u16>("api-port").copied(),
        number_of_buckets: matches
            .get_one::<usize>("buckets")
            .copied()
            .unwrap_or(defaults.number_of_buckets),
        request_timeout_ms: matches
            .get_one::<u64>("request-timeout-ms")
            .copied()
            .unwrap_or(defaults.request_timeout_ms),
        replication_batch_size: matches
            .get_one::<usize>("replication-batch-size")
            .copied()
            .unwrap_or(defaults.replication_batch_size),
        replication_max_retries: matches
            .get_one::<usize>("replication-max-retries")
            .copied()
            .unwrap_or(defaults.replication_max_retries),
        max_concurrent_requests: matches
            .get_one::<usize>("max-concurrent-requests")
            .copied()
            .unwrap_or(defaults.max_concurrent_requests),
        max_concurrent_replication: matches
            .get_one::<usize>("max-concurrent-replication")
            .copied()
            .unwrap_or(defaults.max_concurrent_replication),
    };

    info!("Node configuration: {:?}", config);

    let node = Node::new(config).await?;
    info!("Node {} reachable at {}", node.node_id(), node.address());
    node.start().await?;

    Ok(())
}
