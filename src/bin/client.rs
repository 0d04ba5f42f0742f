//! KV client binary
//!
//! Run with: cargo run --bin kv-client -- --help

use anyhow::{bail, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use kv_rendezvous::client::{ClientConfig, KvClient};
use kv_rendezvous::memory::resident_set_size;
use kv_rendezvous::transport::TransportConfig;
use kv_rendezvous::{KvError, Status};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "kv-client")]
#[command(about = "Client for the in-memory KV server")]
struct Args {
    /// Client node ID
    #[arg(long, default_value = "1")]
    client_id: u32,

    /// Server address (host:port)
    #[arg(long, default_value = "127.0.0.1:50051")]
    server_addr: String,

    /// Values at or above this many bytes move by rendezvous
    #[arg(long, default_value_t = kv_rendezvous::DEFAULT_EAGER_THRESHOLD)]
    eager_threshold: usize,

    /// Send every value inline
    #[arg(long, default_value_t = false)]
    no_rendezvous: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value from the store
    Get {
        /// Key to get
        key: String,
    },
    /// Store a value
    Set {
        /// Key to set
        key: String,
        /// Value to set
        value: String,
    },
    /// Delete a value from the store
    Delete {
        /// Key to delete
        key: String,
    },
    /// Run the end-to-end scenario suite against a live server
    Selftest {
        /// Number of concurrent client sessions
        #[arg(long, default_value = "1")]
        clients: u32,
    },
}

impl Args {
    fn client_config(&self, client_id: u32) -> ClientConfig {
        ClientConfig {
            client_id,
            server_addr: self.server_addr.clone(),
            transport: TransportConfig {
                eager_threshold: self.eager_threshold,
                rendezvous: !self.no_rendezvous,
                ..Default::default()
            },
        }
    }
}

async fn cmd_get(client: &KvClient, key: &str) -> Result<()> {
    let value = client.get(key).await?;
    if !value.is_found() {
        println!("(not found)");
    } else {
        match std::str::from_utf8(&value) {
            Ok(s) => println!("{}", s),
            Err(_) => println!("{:?}", value.as_bytes()),
        }
    }
    value.release();
    Ok(())
}

async fn cmd_set(client: &KvClient, key: &str, value: &str) -> Result<()> {
    client.set(key, value.to_owned()).await?;
    println!("OK");
    Ok(())
}

async fn cmd_delete(client: &KvClient, key: &str) -> Result<()> {
    if client.delete(key).await? {
        println!("Deleted");
    } else {
        println!("Key not found");
    }
    Ok(())
}

/// Outcome tally for one selftest session
#[derive(Default)]
struct Report {
    client_id: u32,
    passed: usize,
    failed: usize,
}

impl Report {
    fn check(&mut self, case: &str, ok: bool) {
        if ok {
            self.passed += 1;
            println!("[client {}] PASS {}", self.client_id, case);
        } else {
            self.failed += 1;
            println!("[client {}] FAIL {}", self.client_id, case);
        }
    }

    fn check_result<T>(&mut self, case: &str, result: &kv_rendezvous::Result<T>) {
        if let Err(e) = result {
            println!("[client {}]      {}: {}", self.client_id, case, e);
        }
        self.check(case, result.is_ok());
    }
}

async fn expect_value(client: &KvClient, key: &str, expected: &[u8]) -> bool {
    match client.get(key).await {
        Ok(value) => {
            let ok = value.is_found() && value.as_bytes() == expected;
            value.release();
            ok
        }
        Err(_) => false,
    }
}

async fn selftest_session(config: ClientConfig) -> Report {
    let mut report = Report {
        client_id: config.client_id,
        ..Default::default()
    };

    let client = match KvClient::open(config).await {
        Ok(client) => {
            report.check("connection", true);
            client
        }
        Err(e) => {
            println!("[client {}]      connection: {}", report.client_id, e);
            report.check("connection", false);
            return report;
        }
    };
    let tag = format!("c{}", report.client_id);

    let key1 = format!("{tag}_key1");
    let result = client.set(&key1, "value1").await;
    report.check_result("set", &result);
    report.check("get after set", expect_value(&client, &key1, b"value1").await);

    let missing = client.get(format!("{tag}_nonexistent_key")).await;
    report.check(
        "get missing key",
        matches!(&missing, Ok(value) if !value.is_found() && value.is_empty()),
    );

    let before = client.outstanding_buffers();
    if let Ok(value) = client.get(&key1).await {
        value.release();
    }
    report.check("release", client.outstanding_buffers() == before);

    let key2 = format!("{tag}_key2");
    let first = client.set(&key1, "value1").await;
    let second = client.set(&key2, "value2").await;
    report.check("multiple set", first.is_ok() && second.is_ok());
    let get1 = expect_value(&client, &key1, b"value1").await;
    let get2 = expect_value(&client, &key2, b"value2").await;
    report.check("multiple get", get1 && get2);

    let large = Bytes::from(vec![b'a'; 64000]);
    let large_key = format!("{tag}_large_key");
    let result = client.set(&large_key, large.clone()).await;
    report.check_result("large set", &result);
    report.check("large get", expect_value(&client, &large_key, &large).await);

    let result = client.close().await;
    report.check_result("close", &result);
    report
}

/// A large SET is served straight out of the caller's buffer: resident
/// memory must not grow while the server pulls it.
async fn zero_copy_session(config: ClientConfig) -> Report {
    let mut report = Report {
        client_id: config.client_id,
        ..Default::default()
    };
    let client = match KvClient::open(config).await {
        Ok(client) => client,
        Err(e) => {
            println!("[client {}]      zero-copy connection: {}", report.client_id, e);
            report.check("zero-copy connection", false);
            return report;
        }
    };

    let large = Bytes::from(vec![b'a'; 64000]);
    let key = format!("c{}_large_key2", report.client_id);
    // First transfer settles one-time allocations of the session
    let warmup = client.set(&key, large.clone()).await;
    report.check_result("zero-copy warmup set", &warmup);

    let before = resident_set_size();
    let result = client.set(&key, large.clone()).await;
    let after = resident_set_size();
    report.check_result("zero-copy set", &result);

    match (before, after) {
        (Ok(before), Ok(after)) => {
            let grown = after.saturating_sub(before);
            if grown > 0 {
                println!(
                    "[client {}]      resident memory grew by {} bytes",
                    report.client_id, grown
                );
            }
            report.check("zero-copy behavior", grown == 0);
        }
        (Err(e), _) | (_, Err(e)) => {
            println!(
                "[client {}]      cannot sample resident memory: {}",
                report.client_id, e
            );
            report.check("zero-copy behavior", false);
        }
    }

    let result = client.close().await;
    report.check_result("zero-copy close", &result);
    report
}

async fn cmd_selftest(args: &Args, clients: u32) -> Result<()> {
    let start = Instant::now();
    let mut sessions = tokio::task::JoinSet::new();
    for i in 0..clients {
        sessions.spawn(selftest_session(args.client_config(args.client_id + i)));
    }

    let mut passed = 0;
    let mut failed = 0;
    while let Some(joined) = sessions.join_next().await {
        let report = joined?;
        passed += report.passed;
        failed += report.failed;
    }

    // Measured alone so no other session allocates during the window
    let report = zero_copy_session(args.client_config(args.client_id)).await;
    passed += report.passed;
    failed += report.failed;

    println!(
        "Selftest: {} passed, {} failed across {} clients in {:.2}s",
        passed,
        failed,
        clients,
        start.elapsed().as_secs_f64()
    );
    if failed > 0 {
        bail!("{} selftest cases failed", failed);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    if let Commands::Selftest { clients } = args.command {
        return cmd_selftest(&args, clients).await;
    }

    let client = KvClient::open(args.client_config(args.client_id)).await?;
    let result = match &args.command {
        Commands::Get { key } => cmd_get(&client, key).await,
        Commands::Set { key, value } => cmd_set(&client, key, value).await,
        Commands::Delete { key } => cmd_delete(&client, key).await,
        Commands::Selftest { .. } => unreachable!("handled above"),
    };
    client.close().await?;
    result
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        let status = e
            .downcast_ref::<KvError>()
            .map(Status::from)
            .unwrap_or(Status::InternalError);
        std::process::exit(status.code());
    }
}
