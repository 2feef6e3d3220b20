use std::io;
use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod auth_command;
mod backoff;
mod config;
mod console;
mod credential;
mod datetime;
mod dedup;
mod error;
mod logging;
mod sync;
mod sync_command;
mod time_entry;
mod toggl;
mod trakt;
mod watch_event;

use auth_command::{AuthArgs, AuthCommand};
use backoff::BackoffPolicy;
use config::Config;
use console::{ConsoleMarkdownList, ConsolePresenter};
use credential::CredentialStore;
use sync::SyncSettings;
use sync_command::{SyncArgs, SyncCommand};
use toggl::TogglClient;
use trakt::{TraktClient, TraktOAuth};

/// Traktの視聴履歴をTogglのtime entryとして記録するCLIアプリケーション。
///
/// # Examples
/// ```
/// $ cargo run -- sync
/// $ cargo run -- sync --days 3
/// $ cargo run -- auth
/// ```
#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    #[clap(short = 'v', long = "verbose", help = "Enable debug logging")]
    verbose: bool,

    #[clap(subcommand)]
    subcommand: SubCommands,
}

/// サブコマンドを表す列挙型。
#[derive(Debug, Subcommand)]
enum SubCommands {
    Sync(SyncArgs),
    Auth(AuthArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose)?;

    let config = Config::load(Path::new(".env"))?;
    let policy = BackoffPolicy::default();
    let oauth = TraktOAuth::new(&config.trakt, policy.clone(), config.request_timeout)?;
    let store = CredentialStore::new(
        config.token_file.clone(),
        oauth,
        config.token_refresh_margin,
    );

    match args.subcommand {
        SubCommands::Sync(sync) => {
            let history =
                TraktClient::new(&config.trakt, &store, policy.clone(), config.request_timeout)?;
            let ledger = TogglClient::new(&config.toggl, policy, config.request_timeout)?;
            let command =
                SyncCommand::new(&store, &history, &ledger, SyncSettings::from_config(&config));
            let report = command.run(sync).await?;

            let mut stdout = io::stdout();
            let mut presenter = ConsoleMarkdownList::new(&mut stdout);
            presenter.show_report(&report)?;
        }
        SubCommands::Auth(auth) => {
            AuthCommand::new(&store).run(auth).await?;
        }
    }

    Ok(())
}
