use std::future::Future;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Install a test log subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `action` until `predicate` holds or `timeout` elapses.
pub async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(10);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<C>(condition: C, timeout: Duration) -> bool
where
    C: Fn() -> bool,
{
    let condition = &condition;
    wait_for_result(move || async move { condition() }, |ok| *ok, timeout)
        .await
        .is_some()
}
