//! Nested transaction walkthrough
//!
//! Runs against the in-memory backend unless `DATABASE_URL` points at a
//! PostgreSQL database. Set `RUST_LOG=elif_tx=debug` to follow the
//! transaction lifecycle.

use elif_tx::{DatabasePool, MemoryBackend, NamedArgs, PostgresPool, RunOptions, TxConfig, TxError, TxManager};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let memory = MemoryBackend::new();
    let pool: Arc<dyn DatabasePool> = match std::env::var("DATABASE_URL") {
        Ok(url) => Arc::new(PostgresPool::connect(&url).await?),
        Err(_) => Arc::new(memory.clone()),
    };

    let manager = TxManager::new(pool, TxConfig::from_env()?)?;
    let ctx = manager.context();
    let (m, c) = (&manager, &ctx);

    // Joined transactions commit together when the outermost call returns
    let account_id = manager
        .run(&ctx, |tx| async move {
            let id = tx
                .insert(
                    "INSERT INTO account (name, balance) VALUES (:name, :balance) RETURNING id",
                    &NamedArgs::new().bind("name", "alice").bind("balance", 100i64),
                )
                .await?;

            m.run(c, |tx| async move {
                tx.update(
                    "UPDATE account SET balance = balance - :amount WHERE id = :id",
                    &NamedArgs::new().bind("amount", 30i64).bind("id", id),
                )
                .await
            })
            .await?;

            Ok::<_, TxError>(id)
        })
        .await?;
    info!("created account {}", account_id);

    // The audit record survives even though the transfer is rolled back
    let transfer = manager
        .run(&ctx, |tx| async move {
            m.run_with(c, RunOptions::requires_new(), |audit| async move {
                audit
                    .insert(
                        "INSERT INTO audit (event) VALUES (:event) RETURNING id",
                        &NamedArgs::new().bind("event", "transfer attempted"),
                    )
                    .await
            })
            .await?;

            tx.delete(
                "DELETE FROM account WHERE id = :id AND balance < 0",
                &NamedArgs::new().bind("id", account_id),
            )
            .await?;

            Err::<(), _>(anyhow::anyhow!("insufficient funds"))
        })
        .await;
    info!("transfer result: {:?}", transfer.err().map(|e| e.to_string()));

    if std::env::var("DATABASE_URL").is_err() {
        let stats = memory.stats();
        info!(
            "memory backend: {} begun, {} committed, {} rolled back",
            stats.begun, stats.committed, stats.rolled_back
        );
        for statement in memory.committed() {
            info!("committed [tx {}]: {}", statement.tx, statement.sql);
        }
    }

    Ok(())
}
