use std::{sync::Arc, time::Duration};

use realtime_core::{CallError, CallResult, RetryPolicy};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{RpcBackend, RpcResponse};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the caller's default timeout.
    pub timeout: Option<Duration>,
    /// Cancels the call (and any pending retry) when triggered.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn cancellable(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// Remote procedure caller that never fails past its boundary.
///
/// Every outcome, including timeouts and cancellations, comes back as a
/// `CallResult`.
#[derive(Clone)]
pub struct SafeCaller {
    backend: Arc<dyn RpcBackend>,
    default_timeout: Duration,
}

impl SafeCaller {
    pub fn new(backend: Arc<dyn RpcBackend>) -> Self {
        Self::with_default_timeout(backend, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_default_timeout(backend: Arc<dyn RpcBackend>, default_timeout: Duration) -> Self {
        Self {
            backend,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Invoke `procedure` once.
    pub async fn call<T: DeserializeOwned>(
        &self,
        procedure: &str,
        params: Value,
        options: &CallOptions,
    ) -> CallResult<T> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let invoke = tokio::time::timeout(timeout, self.backend.invoke(procedure, params));

        let outcome = match &options.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => {
                    debug!(procedure, "call aborted by caller");
                    return CallResult::failure(CallError::aborted(procedure));
                }
                outcome = invoke => outcome,
            },
            None => invoke.await,
        };

        let Ok(response) = outcome else {
            let timeout_ms = timeout.as_millis() as u64;
            warn!(procedure, timeout_ms, "call timed out");
            return CallResult::failure(CallError::timeout(procedure, timeout_ms));
        };

        decode_response(procedure, response)
    }

    /// Invoke `procedure`, retrying network failures with linear backoff.
    ///
    /// Schema errors and unclassified errors are returned after the first
    /// attempt. The last attempt's result is returned as-is.
    pub async fn call_with_retry<T: DeserializeOwned>(
        &self,
        procedure: &str,
        params: Value,
        policy: RetryPolicy,
        options: &CallOptions,
    ) -> CallResult<T> {
        let mut attempt: u32 = 1;

        loop {
            let result = self.call::<T>(procedure, params.clone(), options).await;

            let retryable = result.error.as_ref().is_some_and(CallError::is_network_error);
            if result.succeeded || !retryable {
                if result.is_schema_error() {
                    warn!(procedure, attempt, "schema error, not retrying");
                }
                return result;
            }
            if !policy.allows_retry(attempt - 1) || options.is_cancelled() {
                warn!(procedure, attempt, "giving up after network errors");
                return result;
            }

            let delay = policy.delay_for_attempt(attempt);
            debug!(
                procedure,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying call after network error"
            );

            match &options.cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => return result,
                    _ = tokio::time::sleep(delay) => {}
                },
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }
}

fn decode_response<T: DeserializeOwned>(procedure: &str, response: RpcResponse) -> CallResult<T> {
    if let Some(payload) = response.error {
        let mut error = CallError::classified(payload.code, payload.message);
        error.hint = payload.hint;
        debug!(procedure, error = %error, "call failed");
        return CallResult::failure(error);
    }

    match response.data {
        None | Some(Value::Null) => CallResult::success(None),
        Some(value) => match serde_json::from_value::<T>(value) {
            Ok(data) => CallResult::success(Some(data)),
            Err(err) => {
                warn!(procedure, error = %err, "response did not match expected shape");
                CallResult::failure(CallError::decode(procedure, err))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::{
        backend::{RpcErrorPayload, RpcResponse},
        test_support::{HangingBackend, ScriptedBackend, approx_ms},
    };

    #[derive(Debug, Deserialize, PartialEq)]
    struct Overview {
        unread: u32,
    }

    fn network_error() -> RpcResponse {
        RpcResponse::err(RpcErrorPayload::new("NETWORK_ERROR", "connection reset"))
    }

    fn schema_error() -> RpcResponse {
        RpcResponse::err(RpcErrorPayload::new(
            "PGRST202",
            "Could not find the function public.get_conversations_overview",
        ))
    }

    #[tokio::test]
    async fn decodes_successful_payload() {
        let backend = ScriptedBackend::new(vec![RpcResponse::ok(json!({"unread": 3}))]);
        let caller = SafeCaller::new(backend.clone());

        let result: CallResult<Overview> = caller
            .call("get_conversations_overview", json!({}), &CallOptions::default())
            .await;

        assert!(result.succeeded);
        assert_eq!(result.data, Some(Overview { unread: 3 }));
        assert_eq!(backend.calls(), vec!["get_conversations_overview"]);
    }

    #[tokio::test]
    async fn null_payload_is_success_without_data() {
        let backend = ScriptedBackend::new(vec![RpcResponse::ok(Value::Null)]);
        let caller = SafeCaller::new(backend);

        let result: CallResult<Overview> = caller
            .call("mark_conversation_read", json!({}), &CallOptions::default())
            .await;

        assert!(result.succeeded);
        assert!(result.data.is_none());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn classifies_backend_errors_and_keeps_hint() {
        let mut payload = RpcErrorPayload::new("42883", "function does not exist");
        payload.hint = Some("apply the messaging migration".into());
        let caller = SafeCaller::new(ScriptedBackend::new(vec![RpcResponse::err(payload)]));

        let result: CallResult<Value> = caller
            .call("get_conversations_overview", json!({}), &CallOptions::default())
            .await;

        assert!(!result.succeeded);
        let error = result.error.expect("failure should carry an error");
        assert!(error.is_schema_error());
        assert_eq!(error.hint.as_deref(), Some("apply the messaging migration"));
    }

    #[tokio::test]
    async fn shape_mismatch_becomes_decode_error() {
        let caller = SafeCaller::new(ScriptedBackend::new(vec![RpcResponse::ok(
            json!({"unread": "many"}),
        )]));

        let result: CallResult<Overview> = caller
            .call("get_conversations_overview", json!({}), &CallOptions::default())
            .await;

        let error = result.error.expect("decode failure should be reported");
        assert_eq!(error.code, "DECODE_ERROR");
        assert!(!error.is_schema_error());
        assert!(!error.is_network_error());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_slow_calls_as_network_errors() {
        let caller = SafeCaller::new(Arc::new(HangingBackend));

        let result: CallResult<Value> = caller
            .call(
                "get_conversations_overview",
                json!({}),
                &CallOptions::with_timeout(Duration::from_millis(250)),
            )
            .await;

        let error = result.error.expect("timeout should be reported");
        assert_eq!(error.code, "TIMEOUT");
        assert!(error.is_network_error());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_in_flight_call() {
        let caller = SafeCaller::new(Arc::new(HangingBackend));
        let token = CancellationToken::new();
        let options = CallOptions::default().cancellable(token.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result: CallResult<Value> = caller.call("slow", json!({}), &options).await;
        trigger.await.expect("cancel task");

        let error = result.error.expect("abort should be reported");
        assert_eq!(error.code, "ABORTED");
        assert!(error.is_network_error());
    }

    #[tokio::test(start_paused = true)]
    async fn schema_errors_are_never_retried() {
        let backend = ScriptedBackend::new(vec![schema_error(), RpcResponse::ok(json!(1))]);
        let caller = SafeCaller::new(backend.clone());

        let result: CallResult<Value> = caller
            .call_with_retry(
                "get_conversations_overview",
                json!({}),
                RetryPolicy::new(5, 100),
                &CallOptions::default(),
            )
            .await;

        assert!(result.is_schema_error());
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unclassified_errors_are_not_retried() {
        let backend = ScriptedBackend::new(vec![
            RpcResponse::err(RpcErrorPayload::new("42501", "permission denied")),
            RpcResponse::ok(json!(1)),
        ]);
        let caller = SafeCaller::new(backend.clone());

        let result: CallResult<Value> = caller
            .call_with_retry("p", json!({}), RetryPolicy::new(3, 10), &CallOptions::default())
            .await;

        assert!(!result.succeeded);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_retry_with_linear_backoff_up_to_bound() {
        let backend = ScriptedBackend::new(vec![network_error(), network_error(), network_error()]);
        let caller = SafeCaller::new(backend.clone());

        let result: CallResult<Value> = caller
            .call_with_retry(
                "send_message",
                json!({"body": "hi"}),
                RetryPolicy::new(2, 1_000),
                &CallOptions::default(),
            )
            .await;

        assert!(result.is_network_error());
        assert_eq!(backend.call_count(), 3);

        let gaps = backend.gaps();
        assert_eq!(gaps.len(), 2);
        assert!(approx_ms(gaps[0], 1_000));
        assert!(approx_ms(gaps[1], 2_000));
        assert!(gaps.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success_after_transient_failure() {
        let backend = ScriptedBackend::new(vec![network_error(), RpcResponse::ok(json!({"unread": 1}))]);
        let caller = SafeCaller::new(backend.clone());

        let result: CallResult<Overview> = caller
            .call_with_retry(
                "get_conversations_overview",
                json!({}),
                RetryPolicy::default(),
                &CallOptions::default(),
            )
            .await;

        assert!(result.succeeded);
        assert_eq!(result.data, Some(Overview { unread: 1 }));
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_single_attempt() {
        let backend = ScriptedBackend::new(vec![network_error(), RpcResponse::ok(json!(1))]);
        let caller = SafeCaller::new(backend.clone());

        let result: CallResult<Value> = caller
            .call_with_retry("p", json!({}), RetryPolicy::new(0, 10), &CallOptions::default())
            .await;

        assert!(!result.succeeded);
        assert_eq!(backend.call_count(), 1);
    }
}
