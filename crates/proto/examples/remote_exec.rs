//! Remote Command Execution Example
//!
//! Connects to an SSH server, verifies its host key against
//! `~/.ssh/known_hosts` (asking on first use), logs in with a password and
//! runs one command, similar to `ssh user@host command`.
//!
//! Usage:
//!   cargo run --example remote_exec [host[:port]] [user] [command]
//!
//! Defaults to `localhost:22`, `$USER` and `ps aux`. The password comes from
//! `FERRULE_PASSWORD` or one line of stdin. Set `RUST_LOG=debug` for protocol
//! tracing.

use ferrule_proto::ssh::{
    ChannelRead, Credentials, PublicKey, Session, SessionConfig, TrustDecision,
};
use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Asks on the terminal whether to trust `key`.
fn confirm_host(key: &PublicKey, decision: &TrustDecision) -> bool {
    eprintln!("The authenticity of this host can't be established ({}).", decision);
    eprintln!("{} key fingerprint is {}.", key.algorithm(), key.fingerprint());
    eprint!("Are you sure you want to continue connecting (yes/no)? ");
    let _ = io::stderr().flush();

    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "yes" | "y")
}

/// Reads one line from stdin. The terminal echo is left on.
fn read_password(user: &str) -> io::Result<String> {
    eprint!("{}'s password: ", user);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn parse_target(target: &str) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (target.to_string(), 22),
        },
        None => (target.to_string(), 22),
    }
}

async fn run() -> Result<Option<u32>, Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let (host, port) = parse_target(&args.next().unwrap_or_else(|| "localhost".to_string()));
    let user = args
        .next()
        .or_else(|| env::var("USER").ok())
        .unwrap_or_else(|| "root".to_string());
    let command = args.next().unwrap_or_else(|| "ps aux".to_string());
    let password = match env::var("FERRULE_PASSWORD") {
        Ok(password) => password,
        Err(_) => read_password(&user)?,
    };

    let mut config = SessionConfig::new(host, user.clone()).with_port(port);
    if let Some(home) = env::var_os("HOME") {
        config = config.with_known_hosts_path(PathBuf::from(home).join(".ssh").join("known_hosts"));
    }

    let mut session = Session::new(config);
    session.connect().await?;
    session.verify_host(confirm_host).await?;
    session
        .authenticate(&Credentials::password(user, password))
        .await?;

    let mut channel = session.open_channel().await?;
    channel.request_exec(&command).await?;

    let mut stdout = io::stdout().lock();
    while let ChannelRead::Data(chunk) = channel.read(32 * 1024).await? {
        stdout.write_all(&chunk)?;
    }
    stdout.flush()?;
    drop(stdout);

    let mut stderr = io::stderr().lock();
    while let ChannelRead::Data(chunk) = channel.read_stderr(32 * 1024).await? {
        stderr.write_all(&chunk)?;
    }
    drop(stderr);

    if let Some(signal) = channel.exit_signal() {
        eprintln!("Remote command killed by signal {}", signal.signal);
    }
    let status = channel.exit_status();
    channel.close().await?;
    session.disconnect().await?;
    Ok(status)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    match run().await {
        Ok(Some(status)) => ExitCode::from(u8::try_from(status).unwrap_or(u8::MAX)),
        Ok(None) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
