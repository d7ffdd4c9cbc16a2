use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use ldapgate_core::tls::{load_certificate_der, parse_cert_info};
use ldapgate_core::{AuthOutcome, Authenticator, DirectoryConfig};

#[derive(Parser, Debug)]
#[command(
    name = "ldapgate",
    version,
    about = "Check LDAP logins and lookups against a directory configuration"
)]
struct Cli {
    /// Path to config file (default: ~/.config/ldapgate/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// LDAP host to connect to (overrides config, may be repeated)
    #[arg(short = 'H', long)]
    host: Vec<String>,

    /// LDAP port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a username and password
    Check {
        username: String,
        /// Read the password from this environment variable instead of prompting
        #[arg(long)]
        password_env: Option<String>,
    },
    /// Resolve a username to its distinguished name
    Find { username: String },
    /// Print the thumbprint of a PEM or DER certificate for pinning
    Thumbprint { cert: PathBuf },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("ldapgate_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    debug!("ldapgate starting");

    match cli.command {
        Command::Thumbprint { ref cert } => thumbprint(cert),
        Command::Check {
            ref username,
            ref password_env,
        } => {
            let config = load_config(&cli)?;
            check(&config, username, password_env.as_deref())
        }
        Command::Find { ref username } => {
            let config = load_config(&cli)?;
            find(&config, username)
        }
    }
}

/// Load config from the given or default path and apply CLI overrides.
fn load_config(cli: &Cli) -> Result<DirectoryConfig> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => DirectoryConfig::default_path()
            .ok_or_else(|| anyhow!("cannot determine config directory; pass --config"))?,
    };

    let mut config = DirectoryConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    if !cli.host.is_empty() {
        config.hosts = cli.host.clone();
    }
    if let Some(port) = cli.port {
        config.port = Some(port);
    }
    config.validate()?;

    info!(
        "Using {} host(s) on port {} ({:?})",
        config.hosts.len(),
        config.effective_port(),
        config.tls_mode
    );
    Ok(config)
}

fn check(config: &DirectoryConfig, username: &str, password_env: Option<&str>) -> Result<ExitCode> {
    let password = match password_env {
        Some(var) => Zeroizing::new(
            std::env::var(var).with_context(|| format!("environment variable {var} is not set"))?,
        ),
        None => {
            let prompt = format!("Password for {username}: ");
            Zeroizing::new(
                rpassword::read_password_from_tty(Some(prompt.as_str()))
                    .context("failed to read password")?,
            )
        }
    };

    let mut authenticator = Authenticator::from_config(config)?;
    match authenticator.authenticate(username, &password)? {
        AuthOutcome::Authenticated { dn } => {
            println!("OK {dn}");
            Ok(ExitCode::SUCCESS)
        }
        AuthOutcome::UserNotFound => {
            println!("user not found: {username}");
            Ok(ExitCode::from(2))
        }
        AuthOutcome::InvalidCredentials => {
            println!("invalid credentials for {username}");
            Ok(ExitCode::from(3))
        }
    }
}

fn find(config: &DirectoryConfig, username: &str) -> Result<ExitCode> {
    let mut authenticator = Authenticator::from_config(config)?;
    match authenticator.resolve_dn(username)? {
        Some(dn) => {
            println!("{dn}");
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("user not found: {username}");
            Ok(ExitCode::from(2))
        }
    }
}

fn thumbprint(path: &Path) -> Result<ExitCode> {
    let der = load_certificate_der(path)
        .with_context(|| format!("loading certificate {}", path.display()))?;
    let info = parse_cert_info(&der, "-", 0);
    if info.subject == "Unknown" {
        return Err(anyhow!("{} is not an X.509 certificate", path.display()));
    }

    println!("{}", info.thumbprint);
    println!("subject: {}", info.subject);
    println!("issuer:  {}", info.issuer);
    println!("valid:   {} .. {}", info.not_before, info.not_after);
    println!("sha256:  {}", info.fingerprint_sha256);
    Ok(ExitCode::SUCCESS)
}
