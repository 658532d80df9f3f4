use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::Instrument;

use super::Event;
use super::EventHandler;
use super::ExecutorPool;
use super::SUBSCRIPTION_SPAN_NAME;
use super::executor::Executor;
use crate::configuration;
use crate::error::ExecutionError;
use crate::error::SubscriptionError;
use crate::graphql::Request;
use crate::query_planner::OperationKind;

const DEFAULT_WAIT: Duration = Duration::from_secs(1);

/// Called before an operation starts. An error rejects the operation.
pub trait BeforeStartHook: Send + Sync {
    fn on_before_start(&self, request: &Request) -> Result<(), BoxError>;
}

/// Runs the operations of one connection.
#[derive(Clone)]
pub struct Engine {
    pool: Arc<dyn ExecutorPool>,
    before_start: Option<Arc<dyn BeforeStartHook>>,
    subscriptions: Arc<RwLock<HashMap<String, Registration>>>,
    generation: Arc<AtomicU64>,
    update_interval: Duration,
    max_execution_tries: u32,
    initial_retry_wait: Duration,
}

#[derive(Debug)]
struct Registration {
    token: CancellationToken,
    generation: u64,
}

#[buildstructor::buildstructor]
impl Engine {
    #[builder(visibility = "pub")]
    fn new(
        pool: Arc<dyn ExecutorPool>,
        configuration: Option<configuration::Subscription>,
        before_start_hook: Option<Arc<dyn BeforeStartHook>>,
    ) -> Self {
        let configuration = configuration.unwrap_or_default();
        Self {
            pool,
            before_start: before_start_hook,
            subscriptions: Default::default(),
            generation: Default::default(),
            update_interval: non_zero_or_default(configuration.update_interval),
            max_execution_tries: configuration.max_execution_tries.max(1),
            initial_retry_wait: non_zero_or_default(configuration.initial_retry_wait),
        }
    }

    /// Starts an operation in the background.
    ///
    /// Subscriptions run until stopped or until `connection` is cancelled. Queries and mutations
    /// run once.
    pub fn start_operation(
        &self,
        connection: &CancellationToken,
        id: String,
        request: Request,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), SubscriptionError> {
        let executor = match self.pool.get(request) {
            Ok(executor) => executor,
            Err(error) => {
                handler.emit(Event::Error {
                    id,
                    error: error.clone(),
                });
                return Err(error);
            }
        };

        if let Some(hook) = &self.before_start
            && let Err(error) = hook.on_before_start(executor.request())
        {
            let error = SubscriptionError::OnBeforeStartHook {
                reason: error.to_string(),
            };
            handler.emit(Event::Error {
                id,
                error: error.clone(),
            });
            return Err(error);
        }

        let (token, generation) = {
            let mut subscriptions = self.subscriptions.write();
            if subscriptions.contains_key(&id) {
                drop(subscriptions);
                handler.emit(Event::DuplicatedSubscriberId { id: id.clone() });
                return Err(SubscriptionError::SubscriberIdAlreadyExists { id });
            }
            let token = connection.child_token();
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            subscriptions.insert(
                id.clone(),
                Registration {
                    token: token.clone(),
                    generation,
                },
            );
            (token, generation)
        };

        let span = tracing::info_span!(
            SUBSCRIPTION_SPAN_NAME,
            "otel.kind" = "INTERNAL",
            "subscription.id" = id.as_str(),
            "graphql.operation.kind" = %executor.operation_kind(),
        );
        let engine = self.clone();
        if executor.operation_kind() == OperationKind::Subscription {
            tokio::spawn(
                async move {
                    engine
                        .run_subscription(&token, &id, executor, handler.as_ref())
                        .await;
                    engine.release(&id, generation);
                }
                .instrument(span),
            );
        } else {
            tokio::spawn(
                async move {
                    engine
                        .run_once(&token, &id, executor, handler.as_ref())
                        .await;
                    engine.release(&id, generation);
                }
                .instrument(span),
            );
        }
        Ok(())
    }

    /// Stops a running subscription. Unknown ids are ignored.
    pub fn stop_subscription(
        &self,
        id: &str,
        handler: &dyn EventHandler,
    ) -> Result<(), SubscriptionError> {
        {
            let mut subscriptions = self.subscriptions.write();
            let Some(registration) = subscriptions.remove(id) else {
                return Ok(());
            };
            // under the lock: see `emit_while_running`
            registration.token.cancel();
        }
        handler.emit(Event::SubscriptionCompleted { id: id.to_string() });
        Ok(())
    }

    /// Stops every running operation of the connection.
    pub fn terminate_all_subscriptions(
        &self,
        handler: &dyn EventHandler,
    ) -> Result<(), SubscriptionError> {
        {
            let mut subscriptions = self.subscriptions.write();
            if subscriptions.is_empty() {
                return Ok(());
            }
            for (_, registration) in subscriptions.drain() {
                registration.token.cancel();
            }
        }
        handler.emit(Event::ConnectionTerminatedByServer);
        Ok(())
    }

    /// Number of operations currently running.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.read().len()
    }

    async fn run_subscription(
        &self,
        token: &CancellationToken,
        id: &str,
        mut executor: Box<dyn Executor>,
        handler: &dyn EventHandler,
    ) {
        loop {
            match self.execute_with_backoff(token, executor.as_mut()).await {
                Ok(Some(data)) => {
                    if !data.is_empty() {
                        let data = Event::SubscriptionData {
                            id: id.to_string(),
                            data,
                        };
                        self.emit_while_running(token, handler, data);
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::debug!(%error, "subscription failed");
                    let error = Event::Error {
                        id: id.to_string(),
                        error,
                    };
                    self.emit_while_running(token, handler, error);
                    break;
                }
            }

            // a full interval between the end of one execution and the start of the next
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.update_interval) => {}
            }
        }
    }

    async fn run_once(
        &self,
        token: &CancellationToken,
        id: &str,
        mut executor: Box<dyn Executor>,
        handler: &dyn EventHandler,
    ) {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            result = executor.execute(token) => result,
        };
        let event = match result {
            Ok(data) => Event::NonSubscriptionExecutionResult {
                id: id.to_string(),
                data,
            },
            Err(ExecutionError::Cancelled) => return,
            Err(error) => Event::Error {
                id: id.to_string(),
                error: error.into(),
            },
        };
        self.emit_while_running(token, handler, event);
    }

    /// Emits `event` unless the operation was stopped.
    ///
    /// Operations are cancelled while the registry is write locked, so an event emitted here
    /// never follows the completion of its operation.
    fn emit_while_running(
        &self,
        token: &CancellationToken,
        handler: &dyn EventHandler,
        event: Event,
    ) {
        let _registry = self.subscriptions.read();
        if !token.is_cancelled() {
            handler.emit(event);
        }
    }

    /// Executes once, retrying failures with an exponential backoff.
    ///
    /// Returns `None` once the operation is cancelled.
    async fn execute_with_backoff(
        &self,
        token: &CancellationToken,
        executor: &mut dyn Executor,
    ) -> Result<Option<Bytes>, SubscriptionError> {
        let mut wait = self.initial_retry_wait;
        let mut tries = 0;
        loop {
            tries += 1;
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(None),
                result = executor.execute(token) => result,
            };
            let error = match result {
                Ok(data) => return Ok(Some(data)),
                Err(ExecutionError::Cancelled) => return Ok(None),
                Err(error) => error,
            };
            if tries >= self.max_execution_tries {
                return Err(SubscriptionError::ExecutionTimeout {
                    tries,
                    source: error,
                });
            }
            tracing::debug!(%error, tries, ?wait, "execution failed, retrying");
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(None),
                _ = tokio::time::sleep(wait) => {}
            }
            wait = wait.saturating_mul(2);
        }
    }

    fn release(&self, id: &str, generation: u64) {
        let mut subscriptions = self.subscriptions.write();
        if subscriptions
            .get(id)
            .is_some_and(|registration| registration.generation == generation)
        {
            subscriptions.remove(id);
        }
    }
}

fn non_zero_or_default(duration: Duration) -> Duration {
    if duration.is_zero() {
        DEFAULT_WAIT
    } else {
        duration
    }
}
