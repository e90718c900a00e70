use derive_builder::Builder;

/// Worker configuration, built once from CLI flags.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct WorkerConfig {
    pub master_host: String,
    pub master_port: u16,
    /// Overrides the reported hardware concurrency; falls back to `SystemProbe::hardware_threads()`.
    #[builder(default)]
    pub threads_override: Option<u32>,
}

impl WorkerConfig {
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }
}
