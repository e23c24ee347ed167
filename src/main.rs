use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cove::api::ApiClient;
use cove::attach::{AttachClient, AttachOptions};
use cove::authfile;
use cove::cli::{AttachArgs, Cli, Command, HostArgs, LoginArgs, RelayArgs, SessionArgs, ShareCommand};
use cove::config;
use cove::host::CommandHost;
use cove::relay::auth::Authenticator;
use cove::relay::{Hub, RelayServer, Store, UserStore};
use cove::session::{Runner, SessionOptions};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let result = match cli.command {
        Command::Session(args) => run_session(&cli.endpoint, args, cancel).await,
        Command::Host(args) => run_host(&cli.endpoint, args, cancel).await,
        Command::Attach(args) => run_attach(&cli.endpoint, args, cancel).await,
        Command::Relay(args) => run_relay(args, cancel).await,
        Command::Login(args) => run_login(&cli.endpoint, args).await,
        Command::Share(args) => run_share(&cli.endpoint, args.command).await,
        Command::Sessions => run_sessions(&cli.endpoint).await,
    };

    if let Err(err) = result {
        eprintln!("cove: {err}");
        std::process::exit(1);
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(err) => {
                        debug!(error = %err, "failed to install SIGTERM handler");
                        let _ = tokio::signal::ctrl_c().await;
                        cancel.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel.cancel();
    });
}

async fn run_session(endpoint: &str, args: SessionArgs, cancel: CancellationToken) -> Result<()> {
    let token = if args.publish {
        authfile::access_token(&config::auth_file_path(), endpoint).await?
    } else {
        String::new()
    };
    let runner = Runner::new(SessionOptions {
        endpoint: endpoint.to_string(),
        token,
        session_id: args.session_id.unwrap_or_default(),
        shell: args.shell.unwrap_or_default(),
        term: args.term.unwrap_or_else(|| config::DEFAULT_TERM.to_string()),
        publish: args.publish,
        publish_control: args.publish_control,
        buffer_lines: args.buffer_lines.unwrap_or(0),
        ..Default::default()
    });
    runner.run(cancel).await
}

async fn run_host(endpoint: &str, args: HostArgs, cancel: CancellationToken) -> Result<()> {
    let token = authfile::access_token(&config::auth_file_path(), endpoint).await?;
    let host = CommandHost {
        endpoint: endpoint.to_string(),
        token,
        session_id: args.session_id,
        cols: args.cols,
        rows: args.rows,
        command: args.command,
        term: args.term.unwrap_or_else(|| config::DEFAULT_TERM.to_string()),
        buffer_lines: args.buffer_lines.unwrap_or(0),
    };
    host.run(cancel).await
}

async fn run_attach(endpoint: &str, args: AttachArgs, cancel: CancellationToken) -> Result<()> {
    let share_token = args.share_token.unwrap_or_default();
    let access_token = if share_token.is_empty() {
        authfile::access_token(&config::auth_file_path(), endpoint).await?
    } else {
        String::new()
    };
    let client = Arc::new(AttachClient::new(AttachOptions {
        endpoint: endpoint.to_string(),
        session_id: args.session_id.unwrap_or_default(),
        access_token,
        share_token,
        request_control: args.control,
        client_id: args.client_id.unwrap_or_default(),
    }));
    client.run(cancel).await
}

async fn run_relay(args: RelayArgs, cancel: CancellationToken) -> Result<()> {
    let data_dir = args
        .data_dir
        .map(std::path::PathBuf::from)
        .unwrap_or_else(config::data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let store = Arc::new(Store::load(&data_dir)?);
    let users = Arc::new(UserStore::load(&data_dir.join("users.json"))?);
    if users.is_empty() {
        eprintln!(
            "warning: no users defined in {}; logins will fail until one is created",
            data_dir.join("users.json").display()
        );
    }
    {
        let users = users.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { users.watch(cancel).await });
    }

    let server = RelayServer::new(cove::relay::server::RelayState {
        store,
        auth: Authenticator::new(users.clone()),
        users,
        hub: Arc::new(Hub::new()),
        data_dir,
    });
    let addr = args.listen.parse()?;
    server.serve(addr, cancel).await
}

async fn run_login(endpoint: &str, args: LoginArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => prompt_password()?,
    };
    let totp = match args.totp {
        Some(totp) => totp,
        None => prompt("TOTP code: ")?,
    };
    let client = ApiClient::new(endpoint)?;
    let mut auth = client.login(&args.username, &password, &totp).await?;
    auth.endpoint = endpoint.to_string();
    let path = config::auth_file_path();
    authfile::save(&path, &auth)?;
    println!("logged in; credentials stored in {}", path.display());
    Ok(())
}

async fn run_share(endpoint: &str, command: ShareCommand) -> Result<()> {
    let token = authfile::access_token(&config::auth_file_path(), endpoint).await?;
    let client = ApiClient::new(endpoint)?;
    match command {
        ShareCommand::Create {
            session_id,
            scope,
            ttl,
        } => {
            let share = client
                .share_create(&token, &session_id, &scope, ttl.as_deref())
                .await?;
            println!("{share}");
        }
        ShareCommand::Revoke { token: share_token } => {
            client.share_revoke(&token, &share_token).await?;
            println!("revoked");
        }
    }
    Ok(())
}

async fn run_sessions(endpoint: &str) -> Result<()> {
    let token = authfile::access_token(&config::auth_file_path(), endpoint).await?;
    let client = ApiClient::new(endpoint)?;
    for session in client.list_sessions(&token).await? {
        println!(
            "{}\t{}\t{}\tlast active {}",
            session.id, session.username, session.status, session.last_active_at
        );
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_password() -> Result<String> {
    prompt("password: ")
}
