//! Background loop that surfaces the interactive authorization URL.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::control::backend::{BackendState, ControlBackend};
use crate::observability::NodeLog;

/// Poll the backend until it leaves the login states or shutdown fires,
/// logging each new authorization URL once.
pub(crate) async fn run(
    backend: Arc<dyn ControlBackend>,
    log: NodeLog,
    poll: Duration,
    cancel: CancellationToken,
) {
    let mut shown: Option<String> = None;
    loop {
        let status = backend.status();
        if !matches!(
            status.backend_state,
            BackendState::NeedsLogin | BackendState::NoState
        ) {
            tracing::debug!(state = %status.backend_state, "Auth loop done");
            return;
        }
        if let Some(url) = status.auth_url {
            if shown.as_deref() != Some(url.as_str()) {
                log.info(&format!("To authenticate, visit: {url}"));
                shown = Some(url);
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::backend::{Prefs, StartOptions};
    use crate::observability::LogFn;
    use crate::sim::{MemBackend, MemEngine, MemNetwork};
    use crate::store::MemStore;
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn logs_url_once_and_stops_after_login() {
        let network = MemNetwork::new();
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink: LogFn = {
            let lines = Arc::clone(&lines);
            Arc::new(move |line: &str| lines.lock().unwrap().push(line.to_string()))
        };
        let log = NodeLog::new(Some(sink));
        let backend = MemBackend::new(
            Arc::clone(&network),
            Arc::new(MemStore::new()),
            Arc::new(MemEngine::new(Arc::clone(&network))),
            log.clone(),
        );
        backend
            .start(StartOptions {
                prefs: Prefs::default(),
                ..StartOptions::default()
            })
            .await
            .unwrap();
        backend.start_login_interactive().await.unwrap();

        let task = tokio::spawn(run(
            backend.clone(),
            log,
            Duration::from_secs(5),
            CancellationToken::new(),
        ));
        tokio::time::sleep(Duration::from_secs(12)).await;
        let url = backend.status().auth_url.unwrap();
        network.visit_auth_url(&url).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        task.await.unwrap();

        let lines = lines.lock().unwrap();
        let prompts = lines.iter().filter(|l| l.contains(&url)).count();
        assert_eq!(prompts, 1);
    }

    #[tokio::test]
    async fn exits_on_cancel() {
        let network = MemNetwork::new();
        let backend = MemBackend::new(
            Arc::clone(&network),
            Arc::new(MemStore::new()),
            Arc::new(MemEngine::new(Arc::clone(&network))),
            NodeLog::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        run(backend, NodeLog::default(), Duration::from_secs(60), cancel).await;
    }
}
