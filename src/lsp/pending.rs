//! Correlation of outgoing requests with their responses.
//!
//! Each outstanding call owns a one-shot completion that turns the raw
//! response into the caller's result type. The table hands the caller a
//! [`PendingHandle`] and completes it exactly once: on the matching
//! response, or with `ConnectionClosed` when the session is torn down.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::lsp::error::Error;
use crate::lsp::types::{Outcome, RequestId};

type Completion = Box<dyn FnOnce(Result<Value, Error>) -> bool + Send>;

struct PendingCall {
    method: String,
    complete: Completion,
}

#[derive(Default)]
struct TableState {
    calls: HashMap<RequestId, PendingCall>,
    closed: bool,
}

/// Outstanding calls keyed by request id.
#[derive(Default)]
pub struct CorrelationTable {
    state: Mutex<TableState>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a call to `method` with `id`, whose result decodes as `T`.
    pub fn register<T>(&self, id: RequestId, method: &str) -> Result<PendingHandle<T>, Error>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        if state.calls.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }

        let (tx, rx) = oneshot::channel();
        let complete: Completion = Box::new(move |raw: Result<Value, Error>| {
            let result =
                raw.and_then(|value| serde_json::from_value::<T>(value).map_err(Error::Deserialize));
            tx.send(result).is_ok()
        });
        state.calls.insert(
            id.clone(),
            PendingCall {
                method: method.to_string(),
                complete,
            },
        );
        trace!(%id, method, pending = state.calls.len(), "registered pending call");

        Ok(PendingHandle {
            id,
            method: method.to_string(),
            rx,
        })
    }

    /// Complete the call for `id` with the peer's outcome.
    pub fn resolve(&self, id: &RequestId, outcome: Outcome) -> Result<(), Error> {
        let call = self
            .state
            .lock()
            .calls
            .remove(id)
            .ok_or_else(|| Error::UnknownId(id.clone()))?;

        let raw = match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(error) => Err(Error::Remote(error)),
        };
        if !(call.complete)(raw) {
            debug!(%id, method = %call.method, "response for abandoned call discarded");
        }
        Ok(())
    }

    /// Method of the outstanding call with `id`.
    pub fn method_of(&self, id: &RequestId) -> Option<String> {
        self.state
            .lock()
            .calls
            .get(id)
            .map(|call| call.method.clone())
    }

    /// Forget a call without completing it through the peer, e.g. when its
    /// request could not be written. The caller's handle sees `ConnectionClosed`.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.state.lock().calls.remove(id).is_some()
    }

    /// Fail every outstanding call with `ConnectionClosed` and refuse new ones.
    ///
    /// Returns how many calls were failed.
    pub fn fail_all(&self) -> usize {
        let calls: Vec<(RequestId, PendingCall)> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.calls.drain().collect()
        };

        let count = calls.len();
        for (id, call) in calls {
            trace!(%id, method = %call.method, "failing pending call");
            (call.complete)(Err(Error::ConnectionClosed));
        }
        if count > 0 {
            debug!(count, "failed pending calls on teardown");
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The eventual result of one call.
///
/// Dropping the handle abandons the call locally; the table entry stays until
/// the response arrives or the session ends.
pub struct PendingHandle<T> {
    id: RequestId,
    method: String,
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> PendingHandle<T> {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl<T> Unpin for PendingHandle<T> {}

impl<T> Future for PendingHandle<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without completing: the entry was removed.
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::types::{ErrorCode, ResponseError};
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_delivers_typed_result() {
        let table = CorrelationTable::new();
        let handle = table.register::<i64>(RequestId::Number(1), "add").unwrap();
        assert_eq!(table.method_of(&RequestId::Number(1)).as_deref(), Some("add"));

        table.resolve(&RequestId::Number(1), Outcome::Success(json!(5))).unwrap();
        assert_eq!(handle.await.unwrap(), 5);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_resolution() {
        let table = CorrelationTable::new();
        let first = table.register::<String>(RequestId::Number(1), "echo").unwrap();
        let second = table.register::<String>("two".into(), "echo").unwrap();

        table
            .resolve(&"two".into(), Outcome::Success(json!("second")))
            .unwrap();
        table.resolve(&RequestId::Number(1), Outcome::Success(json!("first"))).unwrap();

        assert_eq!(second.await.unwrap(), "second");
        assert_eq!(first.await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_failure_outcome_is_remote_error() {
        let table = CorrelationTable::new();
        let handle = table.register::<i64>(RequestId::Number(3), "add").unwrap();
        let error = ResponseError::new(ErrorCode::INVALID_PARAMS, "bad");
        table
            .resolve(&RequestId::Number(3), Outcome::Failure(error.clone()))
            .unwrap();
        assert!(matches!(handle.await, Err(Error::Remote(e)) if e == error));
    }

    #[tokio::test]
    async fn test_result_of_wrong_shape_is_deserialize_error() {
        let table = CorrelationTable::new();
        let handle = table.register::<i64>(RequestId::Number(1), "add").unwrap();
        table
            .resolve(&RequestId::Number(1), Outcome::Success(json!("five")))
            .unwrap();
        assert!(matches!(handle.await, Err(Error::Deserialize(_))));
    }

    #[test]
    fn test_unknown_and_duplicate_responses() {
        let table = CorrelationTable::new();
        assert!(matches!(
            table.resolve(&RequestId::Number(9), Outcome::Success(Value::Null)),
            Err(Error::UnknownId(RequestId::Number(9)))
        ));

        let _handle = table.register::<()>(RequestId::Number(1), "shutdown").unwrap();
        table.resolve(&RequestId::Number(1), Outcome::Success(Value::Null)).unwrap();
        assert!(matches!(
            table.resolve(&RequestId::Number(1), Outcome::Success(Value::Null)),
            Err(Error::UnknownId(_))
        ));
    }

    #[test]
    fn test_duplicate_pending_id_rejected() {
        let table = CorrelationTable::new();
        let _first = table.register::<()>(RequestId::Number(1), "a").unwrap();
        assert!(matches!(
            table.register::<()>(RequestId::Number(1), "b"),
            Err(Error::DuplicateId(_))
        ));
        assert_eq!(table.method_of(&RequestId::Number(1)).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_fail_all_completes_every_call() {
        let table = CorrelationTable::new();
        let handles: Vec<_> = (0..5i64)
            .map(|i| table.register::<i64>(RequestId::Number(i), "add").unwrap())
            .collect();

        assert_eq!(table.fail_all(), 5);
        for handle in handles {
            assert!(matches!(handle.await, Err(Error::ConnectionClosed)));
        }
        assert!(table.is_closed());
        assert!(matches!(
            table.register::<i64>(RequestId::Number(10), "add"),
            Err(Error::ConnectionClosed)
        ));
        assert_eq!(table.fail_all(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_disturb_others() {
        let table = CorrelationTable::new();
        let abandoned = table.register::<i64>(RequestId::Number(1), "add").unwrap();
        let kept = table.register::<i64>(RequestId::Number(2), "add").unwrap();
        drop(abandoned);

        assert_eq!(table.len(), 2);
        table.resolve(&RequestId::Number(1), Outcome::Success(json!(1))).unwrap();
        table.resolve(&RequestId::Number(2), Outcome::Success(json!(2))).unwrap();
        assert_eq!(kept.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_removed_call_reports_connection_closed() {
        let table = CorrelationTable::new();
        let handle = table.register::<i64>(RequestId::Number(1), "add").unwrap();
        assert!(table.remove(&RequestId::Number(1)));
        assert!(matches!(handle.await, Err(Error::ConnectionClosed)));
    }
}
