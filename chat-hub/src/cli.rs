use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{hub::HubConfig, limiter::RateLimitConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat hub, accepting participant connections over TCP.
    Server(ServerArgs),
    /// Connect to a hub and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the hub should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_HUB_LISTEN", default_value = "0.0.0.0:50051")]
    pub listen: SocketAddr,

    /// Append chat history to this JSON-lines file instead of keeping it in memory.
    #[arg(long, env = "CHAT_HUB_HISTORY_FILE")]
    pub history_file: Option<PathBuf>,

    /// Number of stored messages replayed to each participant on join.
    #[arg(long, default_value_t = 0)]
    pub replay_history: usize,

    /// Chat messages a participant may send in a burst.
    #[arg(long, default_value_t = crate::limiter::DEFAULT_CAPACITY)]
    pub rate_capacity: u32,

    /// Tokens returned to each participant's budget every second.
    #[arg(long, default_value_t = crate::limiter::DEFAULT_REFILL_RATE)]
    pub rate_refill: u32,
}

impl ServerArgs {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            rate_limit: RateLimitConfig {
                capacity: self.rate_capacity,
                refill_rate: self.rate_refill,
                ..RateLimitConfig::default()
            },
            replay_history: self.replay_history,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name used when joining. Prompted for when omitted.
    #[arg(long)]
    pub username: Option<String>,

    /// Address of the hub to connect to.
    #[arg(long, env = "CHAT_HUB_SERVER", default_value = "localhost:50051")]
    pub server: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_match_the_stock_rate_limit() {
        let cli = Cli::try_parse_from(["chat-hub", "server", "--listen", "127.0.0.1:0"])
            .expect("parse server args");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };

        let config = args.hub_config();
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(config.replay_history, 0);
        assert!(args.history_file.is_none());
    }

    #[test]
    fn client_accepts_username_and_server() {
        let cli = Cli::try_parse_from([
            "chat-hub",
            "client",
            "--username",
            "bob",
            "--server",
            "127.0.0.1:6000",
        ])
        .expect("parse client args");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };

        assert_eq!(args.username.as_deref(), Some("bob"));
        assert_eq!(args.server, "127.0.0.1:6000");
    }
}
