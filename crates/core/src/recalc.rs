//! Counterparty balance recalculation after commit.
//!
//! Ledger writes never wait on or fail because of AR/AP recalculation. Requests
//! are deduplicated, retried a bounded number of times, and failures end up in
//! the logs only. Recalculation is idempotent, so a retry after a partial
//! failure is harmless.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tally_shared::RecalcMode;
use tally_shared::types::{CounterpartyId, TenantId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::collaborators::CounterpartyBalances;

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// One counterparty whose balance needs recomputing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecalcRequest {
    /// Tenant.
    pub tenant_id: TenantId,
    /// Counterparty.
    pub counterparty_id: CounterpartyId,
}

/// Dispatches recalculation requests, inline or to a background task.
#[derive(Clone)]
pub struct RecalculationDispatcher {
    balances: Arc<dyn CounterpartyBalances>,
    max_attempts: u32,
    queue: Option<mpsc::UnboundedSender<RecalcRequest>>,
}

impl std::fmt::Debug for RecalculationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecalculationDispatcher")
            .field("max_attempts", &self.max_attempts)
            .field("background", &self.queue.is_some())
            .finish_non_exhaustive()
    }
}

impl RecalculationDispatcher {
    /// Runs recalculations on the caller's task right after commit.
    #[must_use]
    pub fn inline(balances: Arc<dyn CounterpartyBalances>, max_attempts: u32) -> Self {
        Self {
            balances,
            max_attempts: max_attempts.max(1),
            queue: None,
        }
    }

    /// Spawns a worker task and queues recalculations to it.
    ///
    /// The worker stops once every clone of the dispatcher is dropped. Must be
    /// called from within a tokio runtime.
    #[must_use]
    pub fn background(
        balances: Arc<dyn CounterpartyBalances>,
        max_attempts: u32,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<RecalcRequest>();
        let max_attempts = max_attempts.max(1);
        let worker_balances = Arc::clone(&balances);
        let handle = tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                run_with_retry(worker_balances.as_ref(), request, max_attempts).await;
            }
            debug!("recalculation worker stopped");
        });

        (
            Self {
                balances,
                max_attempts,
                queue: Some(sender),
            },
            handle,
        )
    }

    /// Builds a dispatcher for the configured mode.
    #[must_use]
    pub fn from_mode(
        mode: RecalcMode,
        balances: Arc<dyn CounterpartyBalances>,
        max_attempts: u32,
    ) -> (Self, Option<JoinHandle<()>>) {
        match mode {
            RecalcMode::Inline => (Self::inline(balances, max_attempts), None),
            RecalcMode::Background => {
                let (dispatcher, handle) = Self::background(balances, max_attempts);
                (dispatcher, Some(handle))
            }
        }
    }

    /// Dispatches each distinct request once.
    pub async fn dispatch(&self, requests: impl IntoIterator<Item = RecalcRequest>) {
        let unique: BTreeSet<RecalcRequest> = requests.into_iter().collect();
        for request in unique {
            match &self.queue {
                Some(queue) => {
                    if queue.send(request).is_err() {
                        // Worker gone; fall back to running it here.
                        run_with_retry(self.balances.as_ref(), request, self.max_attempts).await;
                    }
                }
                None => run_with_retry(self.balances.as_ref(), request, self.max_attempts).await,
            }
        }
    }
}

async fn run_with_retry(
    balances: &dyn CounterpartyBalances,
    request: RecalcRequest,
    max_attempts: u32,
) {
    for attempt in 1..=max_attempts {
        match balances
            .recalculate_for_counterparty(request.counterparty_id, request.tenant_id)
            .await
        {
            Ok(()) => {
                debug!(
                    tenant_id = %request.tenant_id,
                    counterparty_id = %request.counterparty_id,
                    attempt,
                    "counterparty balance recalculated"
                );
                return;
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    tenant_id = %request.tenant_id,
                    counterparty_id = %request.counterparty_id,
                    attempt,
                    error = %e,
                    "counterparty recalculation failed, retrying"
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => {
                error!(
                    tenant_id = %request.tenant_id,
                    counterparty_id = %request.counterparty_id,
                    attempts = max_attempts,
                    error = %e,
                    "counterparty recalculation gave up"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl CounterpartyBalances for Flaky {
        async fn recalculate_for_counterparty(
            &self,
            _counterparty_id: CounterpartyId,
            _tenant_id: TenantId,
        ) -> Result<(), CollaboratorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(CollaboratorError::new("balances", "unavailable"))
            } else {
                Ok(())
            }
        }
    }

    fn request() -> RecalcRequest {
        RecalcRequest {
            tenant_id: TenantId::new(),
            counterparty_id: CounterpartyId::new(),
        }
    }

    #[tokio::test]
    async fn test_inline_retries_until_success() {
        let balances = Flaky::new(2);
        let dispatcher = RecalculationDispatcher::inline(balances.clone(), 3);

        dispatcher.dispatch([request()]).await;

        assert_eq!(balances.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_inline_gives_up_after_max_attempts() {
        let balances = Flaky::new(10);
        let dispatcher = RecalculationDispatcher::inline(balances.clone(), 2);

        dispatcher.dispatch([request()]).await;

        assert_eq!(balances.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicates_dispatched_once() {
        let balances = Flaky::new(0);
        let dispatcher = RecalculationDispatcher::inline(balances.clone(), 3);
        let req = request();

        dispatcher.dispatch([req, req, req]).await;

        assert_eq!(balances.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_background_worker_drains_queue() {
        let balances = Flaky::new(0);
        let (dispatcher, handle) = RecalculationDispatcher::background(balances.clone(), 3);

        dispatcher.dispatch([request(), request()]).await;
        drop(dispatcher);
        handle.await.unwrap();

        assert_eq!(balances.calls.load(Ordering::SeqCst), 2);
    }
}
