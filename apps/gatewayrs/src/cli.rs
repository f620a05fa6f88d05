use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "gatewayrs", version, about = "Multi-upstream LLM API gateway")]
pub struct CliArgs {
    /// Path to the channel/key configuration file (STORAGE_BACKEND=json layout).
    #[arg(long, env = "GATEWAYRS_CONFIG")]
    pub config: std::path::PathBuf,

    /// Bind host.
    #[arg(long, env = "GATEWAYRS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port.
    #[arg(long, env = "GATEWAYRS_PORT", default_value_t = 8787)]
    pub port: u16,

    /// Bootstrap admin key (plaintext, must be >= 16 chars).
    #[arg(long, env = "PROXY_ACCESS_KEY")]
    pub access_key: Option<String>,

    /// Allow a short/default bootstrap key outside of development.
    #[arg(long, env = "ALLOW_INSECURE_DEFAULT_KEY", default_value_t = false)]
    pub allow_insecure_default_key: bool,

    /// Gateway-wide RPM ceiling applied to any key with rpm_limit = 0
    /// (spec §3: "per-key RPM, 0 = inherit global"). 0 means unlimited.
    #[arg(long, env = "GATEWAYRS_GLOBAL_RPM", default_value_t = 0)]
    pub global_rpm: u32,
}
