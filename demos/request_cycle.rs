//! Simulates a few requests that enqueue duplicate background work.
//!
//! Run with `RUST_LOG=deferq=debug cargo run --example request_cycle`.

use std::{sync::Arc, time::Duration};

use deferq::{
    Options, RequestScope, args,
    background::{JobError, TokioExecutor, WorkerConfig},
    kwargs, task,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let executor = Arc::new(TokioExecutor::spawn(
        WorkerConfig::new()
            .concurrency(2)
            .retry_backoff(Duration::from_millis(50)),
    ));

    let reindex = task("reindex", executor.clone(), |args, _| {
        tracing::info!(record = %args[0], "reindexing record");
        Ok(json!(null))
    });
    let notify = task("notify", executor, |_, kwargs| match kwargs.get("email") {
        Some(email) => {
            tracing::info!(%email, "sending notification");
            Ok(json!("sent"))
        }
        None => Err(JobError::failed("no recipient")),
    });

    let scope = RequestScope::new();

    // Three mutations of record 7 reindex it once, after the request commits.
    let ok = scope
        .run(async {
            for _ in 0..3 {
                reindex.delay(args![7], kwargs! {}).unwrap();
            }
            notify
                .apply_async(
                    args![],
                    kwargs! {"email" => "ada@example.com"},
                    Options::new().retries(2),
                )
                .unwrap();
            Ok::<_, String>("200 OK")
        })
        .await;
    tracing::info!(?ok, "first request done");

    // A failed request never sends its tasks.
    let failed = scope
        .run(async {
            reindex.delay(args![8], kwargs! {}).unwrap();
            Err::<&str, _>("500 Internal Server Error".to_string())
        })
        .await;
    tracing::info!(?failed, "second request done");

    // Outside a request the task goes straight to the worker.
    if let Ok(Some(handle)) = reindex.delay(args![9], kwargs! {}) {
        let _ = handle.wait().await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
}
