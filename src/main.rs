use anyhow::{bail, Context, Result};
use weighbridge::{logging, platform, simulator, AppConfig, Service};

#[derive(Debug)]
struct Cli {
    config_path: String,
    inject_path: Option<String>,
}

impl Cli {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut config_path: Option<String> = None;
        let mut inject_path: Option<String> = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                    config_path = Some(value);
                }
                "--inject" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--inject requires a path"))?;
                    inject_path = Some(value);
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: weighbridge [--config <path>] [--inject <capture>]\n\
                         --config <path>   Path to TOML configuration (default: config/weighbridge.toml)\n\
                         --inject <path>   Submit a capture file through the upload pipeline and exit"
                    );
                    std::process::exit(0);
                }
                other => {
                    if config_path.is_none() {
                        config_path = Some(other.to_string());
                    } else {
                        bail!("unknown argument '{other}'");
                    }
                }
            }
        }

        Ok(Self {
            config_path: config_path.unwrap_or_else(|| AppConfig::default_path().into()),
            inject_path,
        })
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse()?;

    let config = AppConfig::load(&cli.config_path)
        .with_context(|| format!("unable to load configuration from {}", cli.config_path))?;

    logging::init(&config)?;
    platform::log_platform_guidance();

    if let Some(capture) = cli.inject_path {
        tracing::info!(capture = %capture, "injecting capture file through the upload pipeline");
        simulator::inject_file(capture, &config).await
    } else {
        Service::new(config).run().await
    }
}
