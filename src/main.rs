use std::{path::PathBuf, process::ExitCode, sync::Arc};

use acme_certgen::{
    account::AccountRegistrar,
    certificate::CertificateChain,
    client::HttpClient,
    config::Config,
    directory::{LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING},
    key_pair::KeyPair,
    order::OrderOrchestrator,
    poll::CancellationToken,
    publisher::WebrootPublisher,
    storage::{FsStorage, Storage},
};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error>;

#[derive(Debug, Parser)]
#[command(name = "acme-certgen", version, about = "Issue TLS certificates over ACME HTTP-01")]
struct Cli {
    /// JSON 設定檔路徑
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate an RSA key pair and save it as PEM
    GenerateKey {
        /// Output path, must end with .pem
        path: String,
        #[arg(long, default_value_t = KeyPair::DEFAULT_BITS)]
        bits: u32,
    },
    /// Create or resume the ACME account
    Register(CaArgs),
    /// Run the full issuance flow and save the certificate chain
    Issue {
        #[command(flatten)]
        ca: CaArgs,
        /// Domains to include, overrides the config file
        #[arg(short, long = "domain")]
        domains: Vec<String>,
        #[arg(long)]
        webroot: Option<String>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Report how many days the saved certificate has left
    Check,
}

#[derive(Debug, Args)]
struct CaArgs {
    /// Use the Let's Encrypt staging directory
    #[arg(long, conflicts_with_all = ["production", "directory_url"])]
    staging: bool,
    /// Use the Let's Encrypt production directory
    #[arg(long, conflicts_with = "directory_url")]
    production: bool,
    #[arg(long)]
    directory_url: Option<String>,
    /// Agree to the CA's terms of service
    #[arg(long)]
    accept_terms: bool,
    /// Contact e-mail for the account
    #[arg(short, long = "email")]
    emails: Vec<String>,
}

impl CaArgs {
    fn apply(&self, config: &mut Config) {
        if self.staging {
            config.directory_url = LETS_ENCRYPT_STAGING.to_string();
        } else if self.production {
            config.directory_url = LETS_ENCRYPT_PRODUCTION.to_string();
        } else if let Some(url) = &self.directory_url {
            config.directory_url = url.clone();
        }
        if self.accept_terms {
            config.accept_terms = true;
        }
        if !self.emails.is_empty() {
            config.contact = self.emails.clone();
        }
    }
}

fn load_config(storage: &dyn Storage, path: Option<&PathBuf>) -> Result<Config, BoxError> {
    match path {
        Some(path) => Ok(Config::load(storage, &path.to_string_lossy())?),
        None => Ok(Config::default()),
    }
}

fn register(
    config: &Config,
    client: &HttpClient,
    storage: &dyn Storage,
) -> Result<acme_certgen::account::Account, BoxError> {
    let registrar = AccountRegistrar::new(client, storage, config.account_location_path.clone())
        .contact(&config.contact)
        .retry(config.retry);
    let key_pair = registrar.ensure_account_key(&config.account_key_path, config.key_bits)?;
    Ok(registrar.register_or_resume(key_pair, config.accept_terms)?)
}

fn run(cli: Cli) -> Result<(), BoxError> {
    let storage = Arc::new(FsStorage::new());
    let mut config = load_config(storage.as_ref(), cli.config.as_ref())?;

    match cli.command {
        Command::GenerateKey { path, bits } => {
            let key_pair = KeyPair::generate(bits)?;
            key_pair.save(storage.as_ref(), &path)?;
            tracing::info!(%path, bits, "Key pair written");
        }
        Command::Register(ca) => {
            ca.apply(&mut config);
            let client = HttpClient::new(config.directory_url.clone())?;
            let account = register(&config, &client, storage.as_ref())?;
            println!("{}", account.location);
        }
        Command::Issue {
            ca,
            domains,
            webroot,
            concurrency,
        } => {
            ca.apply(&mut config);
            if !domains.is_empty() {
                config.domains = domains;
            }
            if let Some(webroot) = webroot {
                config.webroot = webroot;
            }
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }

            let client = Arc::new(HttpClient::new(config.directory_url.clone())?);
            let account = register(&config, client.as_ref(), storage.as_ref())?;
            let publisher = Arc::new(WebrootPublisher::new(&config.webroot));
            let orchestrator =
                OrderOrchestrator::new(client, publisher, storage, config.order_settings());

            let cancel = CancellationToken::new();
            #[cfg(unix)]
            {
                use signal_hook::consts::signal::{SIGINT, SIGTERM};
                cancel.cancel_on_signals(&[SIGINT, SIGTERM])?;
            }
            let issued = orchestrator.issue(&account, &cancel)?;
            tracing::info!(
                chain = %config.chain_path,
                order = %issued.order.url,
                "Certificate issued"
            );
        }
        Command::Check => {
            let chain = CertificateChain::from_pem(&storage.read_file(&config.chain_path)?)?;
            let days = chain.days_remaining()?;
            let renew = chain.should_renew(config.renew_before_days)?;
            println!(
                "{}: {} day(s) remaining{}",
                config.chain_path,
                days,
                if renew { ", renewal due" } else { "" }
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "acme-certgen failed");
            ExitCode::FAILURE
        }
    }
}
