use std::time::Duration;

use clap::Parser;
use cli::Cli;
use color_eyre::eyre::{Result, WrapErr, eyre};
use futures::{executor, future::join_all};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    select,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    action::{Action, Input, ParseActionError},
    config::Config,
    editor::{Editor, Notice},
    ids::UserId,
    realtime::{Backoff, RealtimeConnection, RealtimeHub},
};

mod action;
mod change;
mod cli;
mod config;
mod debounce;
mod editor;
mod errors;
mod ids;
mod logging;
mod memo;
mod persist;
mod realtime;
mod reconcile;
mod save;
mod version;
mod wire;

fn main() -> Result<()> {
    bootstrap(|| {
        let args = Cli::parse();
        executor::block_on(run(args))
    })
}

fn bootstrap(fn_do_run: fn() -> Result<()>) -> Result<()> {
    crate::errors::init()?;
    crate::logging::init()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err_with(|| "Failed to start Tokio runtime")?;
    let _guard = runtime.enter();

    let result = fn_do_run();
    runtime.shutdown_timeout(Duration::from_secs(5));

    result
}

async fn run(args: Cli) -> Result<()> {
    let config = Config::new().wrap_err("loading configuration")?;
    let db_path = args
        .database
        .clone()
        .unwrap_or_else(|| config.database_path());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("creating {}", parent.display()))?;
    }
    let db_url = db_path.to_string_lossy().to_string();
    info!("Using database {db_url} with {} session(s)", args.sessions);

    let hub = RealtimeHub::new(config.realtime.channel_capacity);
    let user = args.user.unwrap_or_else(UserId::new);
    let cancel = CancellationToken::new();
    let mut inputs = Vec::new();
    let mut editors = Vec::new();
    let mut printers = Vec::new();
    let mut persist_threads = Vec::new();
    for number in 1..=args.sessions {
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let (persisted_tx, persisted_rx) = mpsc::unbounded_channel();
        persist_threads.push(persist::start_async(&db_url, persist_rx, persisted_tx)?);

        let realtime = RealtimeConnection::new(
            hub.clone(),
            Backoff::new(config.realtime.initial_backoff, config.realtime.max_backoff),
        );
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let editor = Editor::new(
            config.autosave.quiet_interval,
            !args.offline,
            persist_tx,
            realtime,
            notice_tx,
        );
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        action_tx.send(Action::Login(user))?;
        inputs.push(action_tx);

        let label = (args.sessions > 1).then(|| format!("[{number}] "));
        printers.push(tokio::spawn(print_notices(label, notice_rx)));
        editors.push(editor.run(action_rx, persisted_rx, cancel.clone()));
    }

    let input = tokio::spawn(read_input(inputs, hub, cancel.clone()));
    let results = join_all(editors).await;
    cancel.cancel();
    input.abort();
    for printer in printers {
        printer.await?;
    }
    for persist_thread in persist_threads {
        persist_thread
            .join()
            .map_err(|_| eyre!("persist thread panicked"))?;
    }
    debug!("Shut down cleanly");
    results.into_iter().collect()
}

async fn read_input(
    sessions: Vec<UnboundedSender<Action>>,
    hub: RealtimeHub,
    cancel: CancellationToken,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut active = 0;
    loop {
        let line = select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        // EOF closes every action channel, which ends the editors.
        let Some(line) = line else {
            return Ok(());
        };
        match line.parse::<Input>() {
            Ok(Input::Editor(Action::Quit)) => {
                for session in &sessions {
                    session.send(Action::Quit).ok();
                }
                return Ok(());
            }
            Ok(Input::Editor(action)) => {
                if sessions[active].send(action).is_err() {
                    eprintln!("session {} has stopped", active + 1);
                }
            }
            Ok(Input::SwitchSession(number)) if number <= sessions.len() => {
                active = number - 1;
                println!("input goes to session {number}");
            }
            Ok(Input::SwitchSession(number)) => {
                eprintln!("there is no session {number}, only {}", sessions.len());
            }
            Ok(Input::RestartHub) => hub.restart(),
            Err(ParseActionError::Empty) => {}
            Err(err) => eprintln!("{err}"),
        }
    }
}

async fn print_notices(label: Option<String>, mut notice_rx: UnboundedReceiver<Notice>) {
    let label = label.unwrap_or_default();
    while let Some(notice) = notice_rx.recv().await {
        println!("{label}{notice}");
    }
}
