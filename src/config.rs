use std::net::SocketAddr;
use std::thread::available_parallelism;
use std::time::Duration;
use anyhow::{anyhow, bail};

pub const DEFAULT_READ_BUFFER_SIZE: usize = 1350;
pub const DEFAULT_NUM_SHARDS: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_millis(1000);
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(1000);
pub const DEFAULT_WORKER_QUEUE_CAPACITY: usize = 4096;

/// the largest payload that fits into a single IPV4 UDP datagram
const MAX_UDP_PAYLOAD: usize = 65507;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The local addresses to listen on. Each address gets its own socket, and sessions
    ///  remember which of them a peer's first datagram arrived on.
    pub bind_addrs: Vec<SocketAddr>,

    /// Size of the buffer that a single datagram is read into. Datagrams exceeding this size
    ///  are truncated by the operating system.
    ///
    /// The default of 1350 bytes stays below typical path MTUs including tunnel overhead.
    pub read_buffer_size: usize,

    /// Number of independently locked partitions of the session registry. The sweep visits
    ///  one shard per tick, so a session is checked for timeout once per `sweep_period`.
    pub num_shards: usize,

    /// Initial idle timeout of every new session; it can be changed per session afterwards.
    pub idle_timeout: Duration,

    pub sweep_period: Duration,

    /// Number of workers executing callbacks. They run independently of the receive loop,
    ///  so slow callbacks do not block datagram intake.
    pub worker_pool_size: usize,
    /// Datagrams arriving while this many callbacks are queued are dropped.
    pub worker_queue_capacity: usize,

    /// If true, every endpoint sends through a separate socket bound to an ephemeral port.
    ///  Peers then see replies coming from that port rather than from the port they sent to.
    pub separate_send_socket: bool,

    pub shutdown_grace_period: Duration,
}

impl ServerConfig {
    pub fn new(bind_addrs: Vec<SocketAddr>) -> ServerConfig {
        ServerConfig {
            bind_addrs,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            num_shards: DEFAULT_NUM_SHARDS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_period: DEFAULT_SWEEP_PERIOD,
            worker_pool_size: default_worker_pool_size(),
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
            separate_send_socket: false,
            shutdown_grace_period: DEFAULT_SHUTDOWN_GRACE_PERIOD,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addrs.is_empty() {
            bail!("a server needs at least one local address to bind to");
        }
        if self.num_shards == 0 {
            bail!("the session registry needs at least one shard");
        }
        validate_common(self.read_buffer_size, self.idle_timeout, self.sweep_period, self.worker_pool_size, self.worker_queue_capacity)
    }

    /// the interval between two sweep ticks, each of which checks a single shard
    pub fn sweep_tick(&self) -> Duration {
        sweep_tick(self.sweep_period, self.num_shards)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub self_addr: SocketAddr,

    /// The peers this client talks to. Datagrams from any other address are dropped.
    pub peer_addrs: Vec<SocketAddr>,

    pub read_buffer_size: usize,
    pub idle_timeout: Duration,
    pub sweep_period: Duration,

    /// A single worker (the default) preserves the order of datagrams from a peer
    pub worker_pool_size: usize,
    pub worker_queue_capacity: usize,

    pub shutdown_grace_period: Duration,
}

impl ClientConfig {
    pub fn new(self_addr: SocketAddr, peer_addrs: Vec<SocketAddr>) -> ClientConfig {
        ClientConfig {
            self_addr,
            peer_addrs,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_period: DEFAULT_SWEEP_PERIOD,
            worker_pool_size: 1,
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
            shutdown_grace_period: DEFAULT_SHUTDOWN_GRACE_PERIOD,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.peer_addrs.is_empty() {
            bail!("a client needs at least one peer address");
        }
        validate_common(self.read_buffer_size, self.idle_timeout, self.sweep_period, self.worker_pool_size, self.worker_queue_capacity)
    }

    /// clients keep their few sessions in a single shard, so every tick checks all of them
    pub fn sweep_tick(&self) -> Duration {
        sweep_tick(self.sweep_period, 1)
    }
}

fn validate_common(read_buffer_size: usize, idle_timeout: Duration, sweep_period: Duration, worker_pool_size: usize, worker_queue_capacity: usize) -> anyhow::Result<()> {
    if read_buffer_size == 0 || read_buffer_size > MAX_UDP_PAYLOAD {
        bail!("read buffer size must be between 1 and {} bytes, was {}", MAX_UDP_PAYLOAD, read_buffer_size);
    }
    if idle_timeout.is_zero() {
        bail!("idle timeout must not be zero");
    }
    if sweep_period.is_zero() {
        bail!("sweep period must not be zero");
    }
    if worker_pool_size == 0 {
        bail!("worker pool needs at least one worker");
    }
    if worker_queue_capacity == 0 {
        bail!("worker queue capacity must not be zero");
    }
    Ok(())
}

fn sweep_tick(sweep_period: Duration, num_shards: usize) -> Duration {
    let num_shards = u32::try_from(num_shards.max(1)).unwrap_or(u32::MAX);
    (sweep_period / num_shards).max(Duration::from_millis(1))
}

fn default_worker_pool_size() -> usize {
    available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Resolves a host name or literal IP address, picking the first address returned.
pub async fn resolve_socket_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host((host, port)).await?
        .next()
        .ok_or_else(|| anyhow!("host {} did not resolve to any address", host))
}
