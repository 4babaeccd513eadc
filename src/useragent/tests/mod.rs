use super::account::{AccountKey, RegistrationState, RegistryHub};
use super::call::{CallHandle, CallStore};
use super::dtmf::DtmfDispatcher;
use super::state::CallDirection;
use crate::media::NullMediaEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

fn test_handle(call_id: &str) -> Arc<CallHandle> {
    let (events, _events_rx) = unbounded_channel();
    let (status_tx, _status_rx) = watch::channel(Default::default());
    Arc::new(CallHandle {
        call_id: call_id.to_string(),
        account: AccountKey::new("alice", "ex.test"),
        direction: CallDirection::Outgoing,
        events,
        dtmf: DtmfDispatcher::new(
            Arc::new(NullMediaEngine),
            Duration::from_millis(40),
            Arc::new(status_tx),
        ),
    })
}

#[test]
fn test_store_enforces_one_call_per_call_id() {
    let store = CallStore::default();
    store.insert(test_handle("call-1")).expect("first insert");
    assert!(store.insert(test_handle("call-1")).is_err());
    assert_eq!(store.len(), 1);

    store.remove("call-1");
    assert_eq!(store.len(), 0);
    store.insert(test_handle("call-1")).expect("reinsert");
}

#[tokio::test]
async fn test_registry_coalesces_bursts() {
    let (hub, mut rx) = RegistryHub::new();
    let cancel = CancellationToken::new();
    tokio::spawn(hub.clone().coalesce_loop(cancel.clone()));

    // a burst of updates across two accounts
    let alice = AccountKey::new("alice", "ex.test");
    let bob = AccountKey::new("bob", "ex.test");
    hub.set(&alice, RegistrationState::InProgress);
    hub.set(&alice, RegistrationState::Ok);
    hub.set(&bob, RegistrationState::InProgress);
    hub.set(&bob, RegistrationState::Failed);

    tokio::time::timeout(Duration::from_millis(500), rx.changed())
        .await
        .expect("snapshot emitted")
        .expect("sender alive");

    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.states.get(&alice), Some(&RegistrationState::Ok));
    assert_eq!(snapshot.states.get(&bob), Some(&RegistrationState::Failed));
    assert_eq!(snapshot.summary, "1/2 registered");
    cancel.cancel();
}
