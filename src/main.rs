use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use slurm_ssh::{
    AuthResolver, Channel, Cli, Config, JobController, JobIdFile, JobSpec, SlurmSshError,
    SshTransport,
};

async fn run(cli: &Cli) -> Result<i32, SlurmSshError> {
    let config = Config::load(&cli.config)?;

    let resolver = match &config.key_dir {
        Some(dir) => AuthResolver::new(dir),
        None => AuthResolver::from_home()?,
    };
    let transport = SshTransport::new(config.connect_timeout);
    let channel = Channel::establish(transport, config.target(), &resolver).await?;

    let mut controller = JobController::new(
        channel,
        JobSpec::from(&config),
        JobIdFile::new(&config.job_id_file),
        std::io::stdout(),
    );
    controller.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(&cli).await {
        // Scheduler exit codes outside a byte cannot be passed through.
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
