//! CLI configuration for the driver binary. Flags mirror
//! `cmd/csi-vultr-driver/main.go`'s `flag.String` set (`endpoint`, `token`,
//! `driver-name`, `api-url`, `user-agent`) exactly, with `--token`
//! additionally accepting an environment variable since Kubernetes
//! deployments pass secrets through the pod env rather than argv.

use clap::Parser;

use crate::identity::DRIVER_NAME;

#[derive(Parser, Debug)]
#[command(name = "vultr-csi-driver")]
#[command(about = "CSI driver for Vultr block and virtual file system storage")]
pub struct Args {
    /// CSI endpoint (unix:// or tcp://)
    #[arg(
        long,
        env = "CSI_ENDPOINT",
        default_value = "unix:///var/lib/kubelet/plugins/block.csi.vultr.com/csi.sock"
    )]
    pub endpoint: String,

    /// Vultr API token
    #[arg(long, env = "CSI_API_TOKEN")]
    pub token: String,

    /// Name advertised via GetPluginInfo
    #[arg(long, default_value_t = DRIVER_NAME.to_string())]
    pub driver_name: String,

    /// Override the Vultr API base URL
    #[arg(long, env = "VULTR_API_URL")]
    pub api_url: Option<String>,

    /// Custom user agent suffix sent with every provider request
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Address to serve Prometheus metrics on, e.g. 0.0.0.0:9808
    #[arg(long, env = "METRICS_ADDRESS")]
    pub metrics_address: Option<std::net::SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
