use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Client and load generator for toy-redis", long_about = None)]
struct Cli {
    /// Address of the server.
    #[arg(long, default_value = "127.0.0.1:6379")]
    server: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send each request over one connection and print the responses.
    Send {
        #[arg(required = true)]
        requests: Vec<String>,
    },
    /// Hammer the server with a random GET/SET mix from many connections.
    Load(LoadArgs),
}

#[derive(Args, Debug, Clone)]
struct LoadArgs {
    #[arg(long, default_value_t = 100)]
    connections: usize,

    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Share of operations that are GETs, in percent.
    #[arg(long, default_value_t = 80, value_parser = clap::value_parser!(u8).range(0..=100))]
    read_percent: u8,

    /// Upper bound of the random pause between operations.
    #[arg(long, default_value_t = 100)]
    max_pause_ms: u64,

    /// Key every connection reads and writes.
    #[arg(long, default_value = "count")]
    key: String,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn request(&mut self, request: &str) -> Result<String> {
        self.writer
            .write_all(format!("{}\n", request).as_bytes())
            .await?;
        self.writer.flush().await?;

        let mut response = String::new();
        if self.reader.read_line(&mut response).await? == 0 {
            bail!("server closed the connection");
        }
        Ok(response.trim_end_matches(['\n', '\r']).to_string())
    }
}

#[derive(Default)]
struct LoadTotals {
    ops: AtomicU64,
    errors: AtomicU64,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Send { requests } => send(cli.server, &requests).await,
        Command::Load(args) => load(cli.server, args).await,
    }
}

async fn send(addr: SocketAddr, requests: &[String]) -> Result<()> {
    let mut conn = Connection::open(addr).await?;
    for request in requests {
        let response = conn.request(request).await?;
        println!("Response: {}", response);
    }
    Ok(())
}

async fn load(addr: SocketAddr, args: LoadArgs) -> Result<()> {
    let totals = Arc::new(LoadTotals::default());
    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let started = Instant::now();

    let mut handles = Vec::with_capacity(args.connections);
    for number in 0..args.connections {
        let totals = Arc::clone(&totals);
        let args = args.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = drive_connection(addr, number, &args, deadline, &totals).await {
                totals.errors.fetch_add(1, Ordering::Relaxed);
                warn!(connection = number, error = %err, "load connection failed");
            }
        }));
    }
    for handle in handles {
        handle.await.context("load task panicked")?;
    }

    let elapsed = started.elapsed().as_secs_f64();
    let ops = totals.ops.load(Ordering::Relaxed);
    let errors = totals.errors.load(Ordering::Relaxed);
    let error_rate = if ops == 0 {
        0.0
    } else {
        errors as f64 / ops as f64 * 100.0
    };

    println!("==== Sustained load test result ====");
    println!("Total operations: {}", ops);
    println!("Total connections: {}", args.connections);
    println!("Total errors: {}", errors);
    println!("Error rate: {:.2}%", error_rate);
    println!("Ops per second: {:.2}", ops as f64 / elapsed.max(f64::EPSILON));
    Ok(())
}

/// Runs one connection's share of the load until `deadline`. Any failure
/// ends the connection.
async fn drive_connection(
    addr: SocketAddr,
    number: usize,
    args: &LoadArgs,
    deadline: Instant,
    totals: &LoadTotals,
) -> Result<()> {
    let mut conn = Connection::open(addr).await?;
    let mut rng = StdRng::from_entropy();

    while Instant::now() < deadline {
        if rng.gen_range(0..100) < args.read_percent {
            let response = conn.request(&format!("GET {}", args.key)).await?;
            if !response.is_empty() {
                let counter: i64 = response
                    .parse()
                    .with_context(|| format!("GET returned a non-integer {response:?}"))?;
                debug!(connection = number, counter, "read counter");
            }
        } else {
            let response = conn.request(&format!("SET {} {}", args.key, number)).await?;
            debug!(connection = number, %response, "wrote counter");
        }
        totals.ops.fetch_add(1, Ordering::Relaxed);

        if args.max_pause_ms > 0 {
            let pause = rng.gen_range(0..args.max_pause_ms);
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
    }
    Ok(())
}
