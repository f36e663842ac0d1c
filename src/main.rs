// Load i18n translations
rust_i18n::i18n!("locales", fallback = "en");

mod cli;

use clap::Parser;
use cli::Cli;
use console::style;
use ssh_console::utils::error::ConsoleError;
use ssh_console::utils::logger;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logger::init(cli.log_level.as_deref());

    if let Err(e) = cli::run(cli).await {
        let message = match e.downcast_ref::<ConsoleError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{} {}", style("error:").red().bold(), message);
        std::process::exit(1);
    }
}
