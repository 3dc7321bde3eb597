//! Pending outbound calls keyed by correlation id.
//!
//! Each call registers itself with [`PromiseGroup::add`] and awaits the
//! returned [`PendingCall`]. The read path delivers the response through
//! [`PromiseGroup::fulfill`]. A call is fulfilled at most once, and its entry
//! is removed when the `PendingCall` is dropped, whatever the outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::protocol::Message;

/// Identifies who issued a call, so its calls can be failed together.
pub type CallOwner = u64;

struct Pending {
    owner: CallOwner,
    tx: Option<oneshot::Sender<Result<Message>>>,
}

/// Registry of in-flight calls.
#[derive(Clone, Default)]
pub struct PromiseGroup {
    pending: Arc<Mutex<HashMap<String, Pending>>>,
}

impl PromiseGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call. An existing entry with the same id is replaced.
    pub fn add(&self, id: impl Into<String>, owner: CallOwner) -> PendingCall {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.clone(), Pending { owner, tx: Some(tx) });
        PendingCall {
            id,
            group: self.clone(),
            rx: Some(rx),
        }
    }

    /// Remove an entry. Returns true if it was present.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Deliver the outcome of a call.
    ///
    /// Returns true only for the first delivery to a registered id; late or
    /// duplicate responses are dropped.
    pub fn fulfill(&self, id: &str, result: Result<Message>) -> bool {
        let tx = self.lock().get_mut(id).and_then(|p| p.tx.take());
        match tx {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fail every unfulfilled call of `owner` with [`RpcError::ConnectionClosed`].
    ///
    /// Returns the number of calls failed.
    pub fn fail_owner(&self, owner: CallOwner) -> usize {
        let senders: Vec<_> = self
            .lock()
            .values_mut()
            .filter(|p| p.owner == owner)
            .filter_map(|p| p.tx.take())
            .collect();

        let count = senders.len();
        for tx in senders {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
        count
    }

    /// Number of registered calls.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller side of one in-flight call. Dropping it deregisters the call.
pub struct PendingCall {
    id: String,
    group: PromiseGroup,
    rx: Option<oneshot::Receiver<Result<Message>>>,
}

impl PendingCall {
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response, at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] if nothing arrived in time, or the error the call
    /// was fulfilled with.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message> {
        let rx = self.rx.take().ok_or(RpcError::ConnectionClosed)?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(RpcError::Timeout),
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.group.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: &str) -> Message {
        let mut request = Message::request("m", None);
        request.id = id.to_string();
        Message::response_to(&request)
    }

    #[tokio::test]
    async fn test_fulfill_delivers_once() {
        let group = PromiseGroup::new();
        let call = group.add("a", 1);

        assert!(group.fulfill("a", Ok(response("a"))));
        assert!(!group.fulfill("a", Ok(response("a"))));

        let msg = call.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.id, "a");
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_fulfill_unknown_id() {
        let group = PromiseGroup::new();
        assert!(!group.fulfill("nope", Ok(response("nope"))));
    }

    #[tokio::test]
    async fn test_error_delivery() {
        let group = PromiseGroup::new();
        let call = group.add("a", 1);
        group.fulfill("a", Err(RpcError::FunctionNotFound));

        let result = call.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RpcError::FunctionNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let group = PromiseGroup::new();
        let call = group.add("slow", 1);
        assert_eq!(group.len(), 1);

        let result = call.wait(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(RpcError::Timeout)));
        assert!(group.is_empty());

        // Late response is dropped.
        assert!(!group.fulfill("slow", Ok(response("slow"))));
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let group = PromiseGroup::new();
        let call = group.add("a", 1);
        drop(call);
        assert!(group.is_empty());
        assert!(!group.remove("a"));
    }

    #[tokio::test]
    async fn test_fail_owner_only_hits_owner() {
        let group = PromiseGroup::new();
        let mine = group.add("a", 1);
        let theirs = group.add("b", 2);

        assert_eq!(group.fail_owner(1), 1);

        let result = mine.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));

        assert!(group.fulfill("b", Ok(response("b"))));
        assert_eq!(theirs.wait(Duration::from_secs(1)).await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_their_own_response() {
        let group = PromiseGroup::new();
        let calls: Vec<_> = (0..32).map(|i| group.add(format!("id-{i}"), 1)).collect();

        let fulfiller = group.clone();
        tokio::spawn(async move {
            for i in (0..32).rev() {
                let id = format!("id-{i}");
                assert!(fulfiller.fulfill(&id, Ok(response(&id))));
            }
        });

        for (i, call) in calls.into_iter().enumerate() {
            let msg = call.wait(Duration::from_secs(1)).await.unwrap();
            assert_eq!(msg.id, format!("id-{i}"));
        }
        assert!(group.is_empty());
    }
}
