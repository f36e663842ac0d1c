use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// SSH Console - multi-host SSH sessions, tunnels, remote commands and log tailing
#[derive(Parser, Debug)]
#[command(name = "ssh-console")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when unset
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Use this directory instead of the platform config directory
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Message language (en, zh-CN)
    #[arg(long, global = true)]
    pub lang: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List all saved hosts
    List,

    /// Show host details and tunnel rules
    Show {
        /// Host name or ID
        host: String,
    },

    /// Add a new host
    Add {
        /// Display name
        #[arg(short, long)]
        name: String,

        /// SSH host
        #[arg(short = 'H', long)]
        host: String,

        /// SSH port
        #[arg(short, long, default_value = "22")]
        port: u16,

        /// SSH username
        #[arg(short, long)]
        username: String,

        /// SSH private key path
        #[arg(short, long, conflicts_with = "default_keys")]
        key: Option<PathBuf>,

        /// Try ~/.ssh/id_ed25519, id_rsa and id_ecdsa
        #[arg(long)]
        default_keys: bool,

        /// The key is protected by a passphrase
        #[arg(long)]
        passphrase: bool,

        /// Reconnect automatically after the connection drops
        #[arg(long)]
        auto_reconnect: bool,
    },

    /// Delete a host
    Delete {
        /// Host name or ID
        host: String,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Add a local port forwarding rule to a host
    Forward {
        /// Host name or ID
        host: String,

        /// Local port
        #[arg(short, long)]
        local_port: u16,

        /// Remote host, as seen from the SSH server
        #[arg(long, default_value = "localhost")]
        remote_host: String,

        /// Remote port
        #[arg(short, long)]
        remote_port: u16,

        /// Local bind address
        #[arg(long)]
        bind: Option<String>,

        /// Start with the session
        #[arg(long)]
        auto_start: bool,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Connect, start tunnels and stay attached until Ctrl-C
    Connect {
        /// Host name or ID
        host: String,

        /// Reconnect automatically after the connection drops
        #[arg(long)]
        auto_reconnect: bool,
    },

    /// Run a command or a script on a host
    Exec {
        /// Host name or ID
        host: String,

        /// Command to run
        #[arg(
            trailing_var_arg = true,
            allow_hyphen_values = true,
            required_unless_present = "script"
        )]
        command: Vec<String>,

        /// Run each line of this file as a statement
        #[arg(short, long, conflicts_with = "command")]
        script: Option<PathBuf>,

        /// Working directory on the remote host
        #[arg(short, long)]
        workdir: Option<String>,
    },

    /// Follow a remote log file until Ctrl-C
    Tail {
        /// Host name or ID
        host: String,

        /// Remote file path
        path: String,
    },
}
