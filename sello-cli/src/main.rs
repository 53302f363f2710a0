use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sello_core::config::SealConfig;
use sello_core::input::{InputKind, read_input};
use sello_core::keystore::{load_certificate, load_private_key};
use sello_core::original::{
    CanonicalString, FixedOriginalString, OriginalString, OriginalStringFile, TransformCommand,
};
use sello_core::pipeline::seal_files;
use sello_core::seal::sign;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sello")]
#[command(about = "Seal CFDI invoices with a CSD (RSA PKCS#1 v1.5 / SHA-256)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging (unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal a CFDI document and write the sealed copy
    Seal {
        /// Seal config (.properties); flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
        /// CFDI document to seal
        #[arg(long, required_unless_present = "config")]
        xml: Option<PathBuf>,
        /// CSD private key (DER)
        #[arg(long, required_unless_present = "config")]
        key: Option<PathBuf>,
        /// CSD certificate (DER)
        #[arg(long, required_unless_present = "config")]
        cer: Option<PathBuf>,
        /// Private key password
        #[arg(long, env = "SELLO_KEY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[command(flatten)]
        source: SealSource,
        /// XSLT processor used with --xslt
        #[arg(long, default_value = "xsltproc")]
        xslt_processor: String,
        /// Sealed document path (default: <xml stem>_sellado.xml)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the seal of an original string without touching any document
    Sign {
        /// CSD private key (DER)
        #[arg(long)]
        key: PathBuf,
        /// Private key password
        #[arg(long, env = "SELLO_KEY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[command(flatten)]
        source: TextSource,
    },
    /// Print the details of a CSD certificate
    Certificate {
        /// CSD certificate (DER)
        #[arg(long)]
        cer: PathBuf,
        /// Include the base64 DER certificate
        #[arg(long)]
        base64: bool,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
#[group(multiple = false)]
struct SealSource {
    /// Original string, verbatim
    #[arg(long)]
    original_string: Option<String>,
    /// File holding the original string, read verbatim
    #[arg(long)]
    original_string_file: Option<PathBuf>,
    /// XSLT stylesheet computing the original string from the document
    #[arg(long)]
    xslt: Option<PathBuf>,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct TextSource {
    /// Original string, verbatim
    #[arg(long)]
    original_string: Option<String>,
    /// File holding the original string, read verbatim
    #[arg(long)]
    original_string_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Seal {
            config,
            xml,
            key,
            cer,
            password,
            source,
            xslt_processor,
            output,
        } => {
            let config = match config {
                Some(path) => SealConfig::from_properties_file(&path)
                    .with_context(|| format!("failed to load seal config {}", path.display()))?,
                None => SealConfig::new(
                    key.clone().context("--key is required without --config")?,
                    cer.clone().context("--cer is required without --config")?,
                    xml.clone().context("--xml is required without --config")?,
                ),
            };
            let config = apply_overrides(config, xml, key, cer, password, output);
            let source = seal_source(source, xslt_processor, &config)?;

            let outcome = seal_files(&config, source.as_ref())
                .with_context(|| format!("failed to seal {}", config.document_path().display()))?;
            tracing::debug!(seal_len = outcome.seal().as_str().len(), "seal embedded");
            println!("{}", config.output_path().display());
        }
        Commands::Sign {
            key,
            password,
            source,
        } => {
            let der = read_input(InputKind::PrivateKey, &key)?;
            let key = load_private_key(&der, password.as_deref().unwrap_or_default())
                .with_context(|| format!("failed to load private key {}", key.display()))?;
            let message = match (source.original_string, source.original_string_file) {
                (Some(text), _) => CanonicalString::new(text),
                (None, Some(path)) => {
                    CanonicalString::from_utf8(read_input(InputKind::OriginalString, &path)?)?
                }
                (None, None) => anyhow::bail!("--original-string or --original-string-file is required"),
            };
            let seal = sign(&key, &message).context("failed to sign original string")?;
            println!("{}", seal.encode());
        }
        Commands::Certificate { cer, base64, json } => {
            let der = read_input(InputKind::Certificate, &cer)?;
            let certificate = load_certificate(&der)
                .with_context(|| format!("failed to load certificate {}", cer.display()))?;
            let summary = certificate.summary();

            if json {
                let mut value = serde_json::to_value(&summary)?;
                if base64 {
                    value["certificate"] = serde_json::Value::String(certificate.to_base64());
                }
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                if let Some(number) = &summary.certificate_number {
                    println!("NoCertificado: {number}");
                }
                println!("Serial:        {}", summary.serial_number);
                println!("Subject:       {}", summary.subject);
                println!("Issuer:        {}", summary.issuer);
                println!("Not before:    {}", summary.not_before);
                println!("Not after:     {}", summary.not_after);
                if base64 {
                    println!("Certificado:   {}", certificate.to_base64());
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(
    mut config: SealConfig,
    xml: Option<PathBuf>,
    key: Option<PathBuf>,
    cer: Option<PathBuf>,
    password: Option<String>,
    output: Option<PathBuf>,
) -> SealConfig {
    if let Some(path) = xml {
        config = config.with_document_path(path);
    }
    if let Some(path) = key {
        config = config.with_key_path(path);
    }
    if let Some(path) = cer {
        config = config.with_certificate_path(path);
    }
    if let Some(password) = password {
        config = config.with_password(password);
    }
    if let Some(path) = output {
        config = config.with_output_path(path);
    }
    config
}

fn seal_source(
    source: SealSource,
    xslt_processor: String,
    config: &SealConfig,
) -> Result<Box<dyn OriginalString>> {
    if let Some(text) = source.original_string {
        return Ok(Box::new(FixedOriginalString::new(text)));
    }
    if let Some(path) = source.original_string_file {
        return Ok(Box::new(OriginalStringFile::new(path)));
    }
    if let Some(stylesheet) = source.xslt {
        return Ok(Box::new(TransformCommand::xslt(xslt_processor, stylesheet)));
    }
    match config.original_string_file() {
        Some(file) => Ok(Box::new(file)),
        None => anyhow::bail!(
            "no original string: pass --original-string, --original-string-file or --xslt"
        ),
    }
}
