use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use diesel::{Connection, SqliteConnection, connection::SimpleConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tokio::{
    runtime::Builder,
    select,
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::LocalSet,
};
use tracing::{debug, error, info, warn};

mod errors;
mod handle;
pub mod model;
mod schema;
pub use errors::*;
pub use model::*;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Runs the store on its own thread. It stops once `evt_tx` is closed, after
/// working through whatever commands were still queued.
pub fn start_async(
    db_url: &str,
    cmd_rx: UnboundedReceiver<Command>,
    evt_tx: UnboundedSender<Event>,
) -> Result<std::thread::JoinHandle<()>> {
    let handler = PersistHandler {
        conn: prepare_connection(db_url)?,
        cmd_rx,
        evt_tx,
    };
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("building the persist runtime")?;
    let handle = std::thread::Builder::new()
        .name("persist".into())
        .spawn(move || {
            let local = LocalSet::new();
            local.spawn_local(handler.run());
            runtime.block_on(local);
        })?;
    Ok(handle)
}

pub(crate) fn prepare_connection(db_url: &str) -> Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(db_url)
        .wrap_err_with(|| format!("connecting to sqlite {db_url}"))?;
    // Every editing session has its own connection to the same file.
    conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
        .wrap_err("setting connection pragmas")?;

    debug!("Running any pending migrations now.");
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(migrations_run) => {
            for migration in migrations_run {
                info!("Schema migration run: {}", migration);
            }
        }
        Err(e) => Err(eyre!(e)).wrap_err("running sqlite migrations")?,
    }
    Ok(conn)
}

struct PersistHandler {
    conn: SqliteConnection,
    cmd_rx: UnboundedReceiver<Command>,
    evt_tx: UnboundedSender<Event>,
}

impl PersistHandler {
    async fn run(mut self) {
        loop {
            select! {
                biased; // Stop should take prio
                _ = self.evt_tx.closed() => {
                    debug!("Persistence events channel closed, shutting down persist handler...");
                    self.cmd_rx.close();
                    while let Ok(leftover_cmd) = self.cmd_rx.try_recv() {
                        warn!("Still handling leftover command {leftover_cmd:?}");
                        self.try_handle(leftover_cmd).await;
                    }
                    return;
                },
                work_opt = self.cmd_rx.recv() => {
                    let Some(work) = work_opt else {
                        debug!("All command senders gone, shutting down persist handler...");
                        return;
                    };
                    info!("Persistence command: {work:?}");
                    self.try_handle(work).await;
                }
            }
        }
    }

    async fn try_handle(&mut self, cmd: Command) {
        let origin = cmd.origin();
        let event = match handle::handle(&mut self.conn, cmd).await {
            Ok(event) => event,
            Err(error) => {
                error!("Error handling persistence command {origin:?}: {error}");
                Event::Failure { origin, error }
            }
        };
        if let Err(err) = self.evt_tx.send(event) {
            debug!("Unable to send persistence event: {err:?}");
        }
    }
}
