use std::time::Duration;

use derive_builder::Builder;

/// Coordinator configuration. Constructed once from parsed CLI flags (with environment-variable
/// fallbacks, see the `coordinator` binary) and never re-read at runtime.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), build_fn(error = "derive_builder::UninitializedFieldError"))]
pub struct MasterConfig {
    #[builder(default = "\"0.0.0.0\".to_string()")]
    pub bind_address: String,
    pub port: u16,
    #[builder(default = "8")]
    pub max_nodes: usize,
    /// Passed to `TcpSocket::listen`; `TcpListener::bind` has no equivalent knob, which is why
    /// the coordinator binds through `TcpSocket` instead.
    #[builder(default = "8")]
    pub listen_backlog: u32,
    #[builder(default = "Duration::from_millis(2000)")]
    pub heartbeat_interval: Duration,
    #[builder(default = "Duration::from_millis(6000)")]
    pub heartbeat_timeout: Duration,
    /// Workers to wait for before computing the partition. `None` resolves to `max_nodes`.
    #[builder(default)]
    pub expected_workers: Option<usize>,
    pub total_layers: u32,
    pub bytes_per_layer: u64,
    #[builder(default = "128")]
    pub safety_mem_per_thread_mb: u64,
}

impl MasterConfig {
    pub fn expected_workers(&self) -> usize {
        self.expected_workers.unwrap_or(self.max_nodes)
    }

    pub fn builder() -> MasterConfigBuilder {
        MasterConfigBuilder::default()
    }
}
