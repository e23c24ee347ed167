use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "cove",
    about = "Share a live terminal session through a relay, with controller handoff",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "COVE_ENDPOINT",
        default_value = "http://127.0.0.1:8440",
        help = "Relay endpoint URL"
    )]
    pub endpoint: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a local interactive shell session, optionally published to the relay
    Session(SessionArgs),
    /// Run a headless host publishing a command's terminal to the relay
    Host(HostArgs),
    /// Attach to a remote session as a viewer or controller
    Attach(AttachArgs),
    /// Run the relay server
    Relay(RelayArgs),
    /// Log in and store credentials locally
    Login(LoginArgs),
    /// Manage share tokens for a session
    Share(ShareArgs),
    /// List sessions visible to the logged-in user
    Sessions,
}

#[derive(Args, Debug)]
pub struct SessionArgs {
    #[arg(long, env = "COVE_SESSION_ID", help = "Session identifier")]
    pub session_id: Option<String>,

    #[arg(long, help = "Publish this session to the relay")]
    pub publish: bool,

    #[arg(long, help = "Announce the host as controller on connect")]
    pub publish_control: bool,

    #[arg(long, help = "Shell to spawn instead of the login shell")]
    pub shell: Option<String>,

    #[arg(long, env = "COVE_TERM", help = "TERM value for the spawned shell")]
    pub term: Option<String>,

    #[arg(long, help = "Offline buffer budget in line-equivalents")]
    pub buffer_lines: Option<usize>,
}

#[derive(Args, Debug)]
pub struct HostArgs {
    #[arg(long, help = "Session identifier")]
    pub session_id: String,

    #[arg(long, default_value_t = crate::config::DEFAULT_TERMINAL_COLS)]
    pub cols: usize,

    #[arg(long, default_value_t = crate::config::DEFAULT_TERMINAL_ROWS)]
    pub rows: usize,

    #[arg(long, env = "COVE_TERM", help = "TERM value for the spawned command")]
    pub term: Option<String>,

    #[arg(long, help = "Offline buffer budget in line-equivalents")]
    pub buffer_lines: Option<usize>,

    #[arg(trailing_var_arg = true, help = "Command to run (default: $SHELL)")]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct AttachArgs {
    #[arg(help = "Session identifier")]
    pub session_id: Option<String>,

    #[arg(long, help = "Anonymous share token instead of stored credentials")]
    pub share_token: Option<String>,

    #[arg(long, help = "Request the controller lease on attach")]
    pub control: bool,

    #[arg(long, help = "Client label shown to other participants")]
    pub client_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct RelayArgs {
    #[arg(long, default_value = "127.0.0.1:8440", help = "Listen address")]
    pub listen: String,

    #[arg(long, env = "COVE_DATA_DIR", help = "State directory")]
    pub data_dir: Option<String>,
}

#[derive(Args, Debug)]
pub struct LoginArgs {
    #[arg(long)]
    pub username: String,

    #[arg(long, help = "Password (prompted when omitted)")]
    pub password: Option<String>,

    #[arg(long, help = "Current TOTP code")]
    pub totp: Option<String>,
}

#[derive(Args, Debug)]
pub struct ShareArgs {
    #[command(subcommand)]
    pub command: ShareCommand,
}

#[derive(Subcommand, Debug)]
pub enum ShareCommand {
    /// Create a share token for a session
    Create {
        #[arg(long)]
        session_id: String,
        #[arg(long, default_value = "view", help = "view or control")]
        scope: String,
        #[arg(long, help = "Token lifetime, e.g. 30m or 2h (default: no expiry)")]
        ttl: Option<String>,
    },
    /// Revoke a share token
    Revoke {
        #[arg(long)]
        token: String,
    },
}
