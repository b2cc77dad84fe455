mod catalog;
mod chat;
mod cli;
mod llm;
mod logging;
mod model;
mod output;
mod prompt;
mod session;
mod table;
mod web;

use anyhow::Result;
use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Every call starts with the version banner
    println!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Version => Ok(()),
        Command::ListModels { catalog_url } => {
            logging::setup_logging(0);
            catalog::list_models(&catalog_url).await
        }
        Command::Chat(chat_args) => {
            logging::setup_logging(chat_args.verbosity);
            chat::run(chat_args).await
        }
        Command::Web(web_args) => {
            logging::setup_logging(web_args.verbosity);
            web::run(web_args).await
        }
    }
}
