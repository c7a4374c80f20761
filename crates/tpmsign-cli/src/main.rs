// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use tpmsign::{
    flush_stale_handles, Config, Connector, DevicePath, FlushScope, HandleFiles, HandleKind, HashAlg, KeyPolicy,
    KeySource, PcrSelection, Provisioner, SignatureScheme, Signer, TpmSigner, DEFAULT_DEVICE,
};
use tpmsign_verify::{public_key_fingerprint, public_key_pem, verify_signature, Padding};

#[derive(Parser)]
#[command(name = "tpmsign", version, about = "Provision a TPM-resident RSA signing key and sign with it")]
struct Cli {
    /// TPM character device or Unix socket
    #[arg(long, env = "TPM_PATH", default_value = DEFAULT_DEVICE)]
    tpm_path: PathBuf,

    /// File receiving the saved primary key context
    #[arg(long, default_value = "primary.bin")]
    primary_handle: PathBuf,

    /// File receiving the saved signing key context
    #[arg(long, default_value = "key.bin")]
    key_handle: PathBuf,

    /// Stale handles to flush first: all, loaded, saved or transient
    #[arg(long, default_value_t = FlushScope::All)]
    flush: FlushScope,

    /// Signature scheme: rsassa or rsapss
    #[arg(long, default_value_t = SignatureScheme::RsaSsa)]
    scheme: SignatureScheme,

    /// SHA-256 PCR recorded in the keys' creation data (repeatable)
    #[arg(long = "pcr", value_name = "INDEX", default_values_t = [0u8])]
    pcrs: Vec<u8>,

    /// Per-command deadline in milliseconds (socket endpoints only)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Print a JSON report instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Flush stale handles and exit
    Flush,
    /// Flush stale handles, then create and save a new signing key
    Provision,
    /// Sign a message with an existing key and verify the signature
    Sign {
        #[arg(long)]
        message: String,
        /// Use a key resident at this persistent handle instead of the key file
        #[arg(long, value_parser = parse_persistent_handle)]
        persistent_handle: Option<u32>,
    },
    /// Flush, provision, sign and verify in one go
    Run {
        #[arg(long, default_value = "foo")]
        message: String,
    },
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            device: self.tpm_path.clone(),
            primary_handle_file: self.primary_handle.clone(),
            key_handle_file: self.key_handle.clone(),
            flush: self.flush,
            policy: KeyPolicy {
                pcr_selection: PcrSelection::new(HashAlg::Sha256, &self.pcrs),
                scheme: self.scheme,
                ..KeyPolicy::default()
            },
            command_timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

fn parse_persistent_handle(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    let handle = parsed.map_err(|e| format!("invalid handle '{}': {}", s, e))?;
    if HandleKind::of(handle) != Some(HandleKind::Persistent) {
        return Err(format!("0x{:08X} is not a persistent handle", handle));
    }
    Ok(handle)
}

#[derive(Debug, Default, Serialize)]
struct Report {
    device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    flushed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    primary_handle_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_handle_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<SignatureReport>,
}

#[derive(Debug, Serialize)]
struct SignatureReport {
    message: String,
    scheme: SignatureScheme,
    /// Base64
    signature: String,
    public_key_pem: String,
    /// SHA-256 of the SubjectPublicKeyInfo, hex
    public_key_fingerprint: String,
    verified: bool,
}

fn main() {
    let cli = Cli::parse();

    env_logger::builder()
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let result = main_inner(cli);
    let _ = io::stdout().flush();

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn main_inner(cli: Cli) -> Result<()> {
    let config = cli.config();
    let device = DevicePath::new(&config.device).with_timeout(config.command_timeout);
    let mut report = Report {
        device: device.endpoint(),
        ..Report::default()
    };

    match &cli.command {
        Command::Flush => {
            report.flushed = Some(flush(&device, &config, cli.json)?);
        }
        Command::Provision => {
            report.flushed = Some(flush(&device, &config, cli.json)?);
            provision(&device, &config, &mut report)?;
        }
        Command::Sign {
            message,
            persistent_handle,
        } => {
            let source = match persistent_handle {
                Some(handle) => KeySource::Persistent(*handle),
                None => KeySource::ContextFile(config.key_handle_file.clone()),
            };
            report.signature = Some(sign_and_verify(&device, source, &config, message)?);
        }
        Command::Run { message } => {
            report.flushed = Some(flush(&device, &config, cli.json)?);
            provision(&device, &config, &mut report)?;
            let source = KeySource::ContextFile(config.key_handle_file.clone());
            report.signature = Some(sign_and_verify(&device, source, &config, message)?);
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn flush(device: &DevicePath, config: &Config, quiet: bool) -> Result<usize> {
    let mut tpm = device.connect()?;
    let flushed = flush_stale_handles(&mut tpm, config.flush).context("Failed to flush stale handles")?;
    tpm.close()?;

    if !quiet {
        for handle in &flushed.flushed {
            println!("Handle 0x{:08X} flushed", handle);
        }
    }
    Ok(flushed.count())
}

fn provision(device: &DevicePath, config: &Config, report: &mut Report) -> Result<()> {
    let files = HandleFiles::from(config);
    let key = Provisioner::new(device, &config.policy)
        .provision(&files)
        .context("Provisioning failed")?;
    info!(
        "Provisioned {}-bit signing key ({} byte context)",
        key.public.key_bits,
        key.signing.len()
    );

    report.primary_handle_file = Some(files.primary);
    report.key_handle_file = Some(files.key);
    Ok(())
}

fn sign_and_verify(device: &DevicePath, source: KeySource, config: &Config, message: &str) -> Result<SignatureReport> {
    let scheme = config.policy.scheme;
    let signer = TpmSigner::new(device, source, scheme).context("Failed to open signing key")?;

    let digest = Sha256::digest(message.as_bytes());
    let signature = signer.sign(&digest, HashAlg::Sha256).context("Signing failed")?;

    let padding = match scheme {
        SignatureScheme::RsaSsa => Padding::Pkcs1v15,
        SignatureScheme::RsaPss => Padding::Pss,
    };
    if let Err(e) = verify_signature(signer.public(), padding, &digest, &signature) {
        bail!("Signature produced by the TPM does not verify: {}", e);
    }

    Ok(SignatureReport {
        message: message.to_string(),
        scheme,
        signature: STANDARD.encode(&signature),
        public_key_pem: public_key_pem(signer.public())?,
        public_key_fingerprint: public_key_fingerprint(signer.public())?,
        verified: true,
    })
}

fn print_report(report: &Report) {
    if let Some(count) = report.flushed {
        println!("{} handle(s) flushed", count);
    }
    if let Some(path) = &report.key_handle_file {
        println!("Signing key context saved to {}", path.display());
    }
    if let Some(signature) = &report.signature {
        println!("Signature ({}): {}", signature.scheme, signature.signature);
        println!("Public key fingerprint: {}", signature.public_key_fingerprint);
        print!("{}", signature.public_key_pem);
        println!("Signature verified");
    }
}
