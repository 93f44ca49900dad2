use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use zeroize::Zeroizing;

use secret_signer::source::keyfile;
use secret_signer::{
    DirectorySignerProvider, LoadOptions, PublicKey, SecretBytes, SecretRef, SignerFactory,
    SignerProvider,
};

#[derive(Parser)]
#[command(name = "secret-signer")]
#[command(about = "Load secp256k1 signing keys from secret stores and sign with them")]
#[command(version)]
struct Cli {
    /// Only log warnings and errors
    #[arg(short, long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve every configured key source and report the outcome of each
    List {
        /// TOML file with [[keySource]] entries, or a directory of descriptor files
        #[arg(short, long, env = "SECRET_SIGNER_CONFIG")]
        config: PathBuf,
        /// Fail unless every key source loads
        #[arg(long, default_value_t = false)]
        require_all: bool,
    },
    /// Sign a hex payload with one of the loaded keys
    Sign {
        #[arg(short, long, env = "SECRET_SIGNER_CONFIG")]
        config: PathBuf,
        /// Public key of the signer (0x-prefixed x||y hex, or SEC1 hex)
        #[arg(long)]
        public_key: PublicKey,
        /// Hex payload; hashed with Keccak-256 unless --prehash is given
        #[arg(long)]
        message: String,
        /// Treat the payload as a 32-byte digest and sign it as is
        #[arg(long, default_value_t = false)]
        prehash: bool,
    },
    /// Encrypt a plain key file under a password
    EncryptKey {
        /// Plain key file: 32 raw bytes or 64 hex characters
        #[arg(long)]
        key: PathBuf,
        /// Where to read the password: env:NAME or file:PATH
        #[arg(long)]
        password: SecretRef,
        /// Output path for the encrypted JSON key file
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = keyfile::DEFAULT_ITERATIONS)]
        iterations: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let default_filter = if cli.quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::List { config, require_all } => list(&config, require_all).await,
        Command::Sign { config, public_key, message, prehash } => {
            sign(&config, &public_key, &message, prehash).await
        }
        Command::EncryptKey { key, password, output, iterations } => {
            encrypt_key(&key, &password, &output, iterations)
        }
    }
}

async fn load(config: &Path, require_all: bool) -> Result<DirectorySignerProvider> {
    let mut options = LoadOptions::default();
    if require_all {
        options = options.require_all();
    }
    DirectorySignerProvider::from_config_path(config, options)
        .await
        .with_context(|| format!("failed to load key sources from {}", config.display()))
}

async fn list(config: &Path, require_all: bool) -> Result<()> {
    let provider = load(config, require_all).await?;

    let mut keys: Vec<PublicKey> = provider.available_public_keys().into_iter().collect();
    keys.sort();
    let keys: Vec<_> = keys
        .iter()
        .map(|key| json!({ "publicKey": key, "address": key.ethereum_address().to_string() }))
        .collect();
    let report = json!({ "outcomes": provider.outcomes(), "keys": keys });
    println!("{}", serde_json::to_string_pretty(&report)?);

    provider.shutdown().await;
    Ok(())
}

async fn sign(config: &Path, public_key: &PublicKey, message: &str, prehash: bool) -> Result<()> {
    let payload = hex::decode(message.trim().trim_start_matches("0x")).context("message is not valid hex")?;
    let provider = load(config, false).await?;

    let Some(signer) = provider.get_signer(public_key) else {
        provider.shutdown().await;
        bail!("no loaded key matches {public_key}");
    };

    let signature = if prehash {
        let digest: [u8; 32] = payload
            .as_slice()
            .try_into()
            .context("--prehash requires exactly 32 bytes")?;
        signer.sign_prehash(&digest)?
    } else {
        signer.sign(&payload)?
    };
    provider.shutdown().await;

    let report = json!({
        "publicKey": public_key,
        "address": public_key.ethereum_address().to_string(),
        "r": format!("0x{}", hex::encode(signature.r())),
        "s": format!("0x{}", hex::encode(signature.s())),
        "v": signature.v(),
        "signature": signature.to_string(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn encrypt_key(key: &Path, password: &SecretRef, output: &Path, iterations: u32) -> Result<()> {
    if output.exists() {
        bail!("refusing to overwrite {}", output.display());
    }

    let raw = std::fs::read(key).with_context(|| format!("failed to read {}", key.display()))?;
    let raw = SecretBytes::from(Zeroizing::new(raw));
    let scalar = SignerFactory::scalar_bytes(&raw).context("key file does not hold a valid secp256k1 key")?;
    drop(raw);
    let public_key = SignerFactory::create(SecretBytes::from_slice(scalar.as_slice()))?.identity();

    let password: Zeroizing<String> = password.resolve_string()?;
    let encrypted = keyfile::encrypt_with_iterations(scalar.as_slice(), password.as_bytes(), iterations)?;
    std::fs::write(output, encrypted).with_context(|| format!("failed to write {}", output.display()))?;

    tracing::info!(output = %output.display(), %public_key, "wrote encrypted key file");
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "publicKey": public_key,
            "address": public_key.ethereum_address().to_string(),
            "output": output,
        }))?
    );
    Ok(())
}
