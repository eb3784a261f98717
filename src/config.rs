use clap::Parser;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "HTTP/HTTPS forward proxy",
    long_about = "hproxy is a forward proxy: it tunnels CONNECT requests, relays plain HTTP\n\
requests to origin servers, and serves a small set of built-in endpoints\n\
(/ip, /net, /metrics) plus static files when a request targets the proxy itself.\n\n\
Features:\n\
- Optional TLS termination (--cert/--key)\n\
- Basic proxy authentication with a private/loopback fast path\n\
- Per-connection and process-wide traffic accounting\n\
- Idle-timeout supervision\n"
)]
pub struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3128)]
    pub port: u16,

    /// IP address to bind the listener
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// TLS certificate chain file (PEM). Enables TLS together with --key.
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// Proxy credentials as comma-separated user:pass pairs
    #[arg(long, value_delimiter = ',')]
    pub users: Option<Vec<String>>,

    /// Require authentication for tunnel/forward requests from public addresses
    #[arg(long, default_value_t = false)]
    pub require_auth: bool,

    /// Header name whose presence bypasses the admission gate
    #[arg(long)]
    pub bypass_header: Option<String>,

    /// Directory served for requests targeting the proxy itself
    #[arg(long, default_value = ".")]
    pub web_root: PathBuf,

    /// Idle timeout in seconds; a connection with no traffic for this long is closed
    #[arg(long, default_value_t = 15)]
    pub idle_timeout: u64,

    /// Upstream TCP connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,
}

/// Proxy server configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub tls: Option<(PathBuf, PathBuf)>,
    /// Full `Basic <base64>` header values accepted by the admission gate
    pub credentials: HashSet<String>,
    pub require_auth: bool,
    pub bypass_header: Option<String>,
    pub web_root: PathBuf,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        use base64::engine::general_purpose;
        use base64::Engine;

        let listen_addr = SocketAddr::from((args.listen_ip, args.port));

        let mut credentials = HashSet::new();
        for pair in args.users.iter().flatten() {
            if !pair.contains(':') {
                return Err(color_eyre::eyre::eyre!(
                    "Invalid --users entry {:?}, expected user:pass",
                    pair
                ));
            }
            credentials.insert(format!("Basic {}", general_purpose::STANDARD.encode(pair)));
        }

        if args.require_auth && credentials.is_empty() {
            return Err(color_eyre::eyre::eyre!(
                "--require-auth needs at least one --users entry"
            ));
        }

        let tls = match (args.cert, args.key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        };

        Ok(Self {
            listen_addr,
            tls,
            credentials,
            require_auth: args.require_auth,
            bypass_header: args.bypass_header.map(|h| h.to_ascii_lowercase()),
            web_root: args.web_root,
            idle_timeout: Duration::from_secs(args.idle_timeout),
            connect_timeout: Duration::from_secs(args.connect_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli::parse_from(["hproxy"])
    }

    #[test]
    fn credentials_are_basic_encoded() {
        let mut cli = base_cli();
        cli.users = Some(vec!["user:password".to_string()]);

        let config = ProxyConfig::from_cli(cli).unwrap();
        // base64("user:password") == "dXNlcjpwYXNzd29yZA=="
        assert!(config.credentials.contains("Basic dXNlcjpwYXNzd29yZA=="));
        assert_eq!(config.credentials.len(), 1);
    }

    #[test]
    fn invalid_user_entry_is_rejected() {
        let mut cli = base_cli();
        cli.users = Some(vec!["missing-colon".to_string()]);

        assert!(ProxyConfig::from_cli(cli).is_err());
    }

    #[test]
    fn require_auth_without_users_is_rejected() {
        let mut cli = base_cli();
        cli.require_auth = true;

        assert!(ProxyConfig::from_cli(cli).is_err());
    }

    #[test]
    fn bypass_header_is_lowercased() {
        let mut cli = base_cli();
        cli.bypass_header = Some("X-Secret-Knock".to_string());

        let config = ProxyConfig::from_cli(cli).unwrap();
        assert_eq!(config.bypass_header.as_deref(), Some("x-secret-knock"));
    }

    #[test]
    fn defaults() {
        let config = ProxyConfig::from_cli(base_cli()).unwrap();
        assert_eq!(config.listen_addr.port(), 3128);
        assert!(config.tls.is_none());
        assert!(!config.require_auth);
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
