mod cli;
mod paths;
mod run;

use std::process::ExitCode;

use anyhow::Result;
use cli::Command;
use paths::AppPaths;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = cli::parse();
    run::initialise_tracing();

    let paths = AppPaths::discover()?;
    let config = run::load_config(cli.config.as_deref(), &paths)?;

    match cli.command {
        Command::Render(args) => run::render(config, args).await,
        Command::Validate(args) => run::validate_files(&config, &args),
        Command::Cache(cache) => run::cache(&config, cache.action),
        Command::Where => {
            run::describe_paths(&paths, &config);
            Ok(ExitCode::SUCCESS)
        }
    }
}
