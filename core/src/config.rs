use clap::Parser;

/// Process-level configuration, read once at startup. Every key in the
/// platform's configuration contract gets a flag here, each mirrored by an
/// environment variable of the same name — the same `clap::Parser` shape
/// the teacher uses for its own binaries, just with `env = "..."` added to
/// every field so a container-orchestrated deployment (the normal way to
/// configure a process like this one) works without passing flags at all.
#[derive(Parser, Debug, Clone)]
#[command(name = "renderlite-worker", about = "RenderLite deployment worker")]
pub struct Config {
    /// Suffix for auto-assigned hostnames.
    #[arg(long, env = "BASE_DOMAIN", default_value = "renderlite.local")]
    pub base_domain: String,

    /// Port the proxy forwards to inside every managed container.
    #[arg(long, env = "CONTAINER_PORT", default_value_t = 3000)]
    pub container_port: u16,

    /// Build budget, in milliseconds.
    #[arg(long, env = "BUILD_TIMEOUT_MS", default_value_t = 300_000)]
    pub build_timeout_ms: u64,

    /// Clone budget, in milliseconds.
    #[arg(long, env = "CLONE_TIMEOUT_MS", default_value_t = 60_000)]
    pub clone_timeout_ms: u64,

    /// Delay before the first health check attempt, in seconds.
    #[arg(long, env = "HEALTH_CHECK_START_DELAY_SEC", default_value_t = 5)]
    pub health_check_start_delay_sec: u64,

    /// Per-attempt health check timeout, in seconds.
    #[arg(long, env = "HEALTH_CHECK_TIMEOUT_SEC", default_value_t = 5)]
    pub health_check_timeout_sec: u64,

    /// Maximum health check attempts.
    #[arg(long, env = "HEALTH_CHECK_RETRIES", default_value_t = 10)]
    pub health_check_retries: u32,

    /// When set, router labels advertise TLS + a cert resolver.
    #[arg(long, env = "ENABLE_TLS", default_value_t = false)]
    pub enable_tls: bool,

    /// 32-byte hex key used for the secret envelope (`ENCRYPTION_KEY`).
    #[arg(long, env = "ENCRYPTION_KEY")]
    pub encryption_key: String,

    /// Default concurrency per logical queue.
    #[arg(long, env = "QUEUE_CONCURRENCY", default_value_t = 2)]
    pub queue_concurrency: usize,

    /// Rolling rate limit: jobs per window, per queue.
    #[arg(long, env = "QUEUE_RATE_LIMIT", default_value_t = 5)]
    pub queue_rate_limit: u32,

    /// Rolling rate limit window, in seconds.
    #[arg(long, env = "QUEUE_RATE_WINDOW_SEC", default_value_t = 60)]
    pub queue_rate_window_sec: u64,

    /// Max attempts before a job is abandoned (infrastructural errors only).
    #[arg(long, env = "QUEUE_MAX_ATTEMPTS", default_value_t = 3)]
    pub queue_max_attempts: u32,

    /// Base delay, in milliseconds, for a nacked job's exponential backoff
    /// before it's requeued.
    #[arg(long, env = "QUEUE_RETRY_BASE_DELAY_MS", default_value_t = 1_000)]
    pub queue_retry_base_delay_ms: u64,

    /// Reconciler sweep interval, in minutes.
    #[arg(long, env = "RECONCILE_INTERVAL_MIN", default_value_t = 60)]
    pub reconcile_interval_min: u64,

    /// Docker engine socket. Not named in the egress contract's
    /// Configuration list (the daemon's location is "out of band" per the
    /// spec), but the process still needs to be told where it is.
    #[arg(
        long,
        env = "DOCKER_HOST_SOCKET",
        default_value = "unix:///var/run/docker.sock"
    )]
    pub docker_host: String,

    /// Shared Docker network every managed container attaches to.
    #[arg(long, env = "MANAGED_NETWORK", default_value = "renderlite_net")]
    pub managed_network: String,

    /// Label prefix the reverse proxy reads (`traefik` by default, since
    /// the label vocabulary in the container controller's label contract
    /// is Traefik's).
    #[arg(long, env = "PROXY_LABEL_PREFIX", default_value = "traefik")]
    pub proxy_label_prefix: String,

    /// SQLite DSN for the data access layer.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://renderlite.sqlite")]
    pub database_url: String,
}

impl Config {
    pub fn build_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.build_timeout_ms)
    }

    pub fn clone_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.clone_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reconcile_interval_min * 60)
    }
}
