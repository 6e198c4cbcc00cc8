//! Simulated authoritative store.
//!
//! Calls from [`SimRemote`] clients are queued and only processed when the
//! simulator says so, once per round. Replies and committed changes then
//! travel back over the [`SimulatedNetwork`], so every response and every
//! feed event can be delayed relative to the others.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::channel::oneshot;
use tracing::trace;

use linkshelf_core::error::{FeedError, RemoteError};
use linkshelf_core::remote::{FeedStream, RemoteStore};
use linkshelf_core::{ChangeEvent, ChangeKind, Item, ItemId, NewItem, OwnerId};

use crate::network::{ClientId, NetworkMessage, Payload, SimulatedNetwork};
use crate::rng::DeterministicRng;
use crate::trace::{CallOp, CallOutcome, TraceEvent, TraceEventKind};

/// Owner used for events leaked to the wrong subscriber.
pub const INTRUDER: &str = "intruder";

type Reply<T> = oneshot::Sender<Result<T, RemoteError>>;

enum Request {
    Create { owner: OwnerId, draft: NewItem, reply: Reply<Item> },
    Delete { id: ItemId, reply: Reply<()> },
    List { owner: OwnerId, reply: Reply<Vec<Item>> },
}

struct QueuedCall {
    client: ClientId,
    caller: OwnerId,
    request: Request,
}

enum ReadyReply {
    Create(Reply<Item>, Result<Item, RemoteError>),
    Delete(Reply<()>, Result<(), RemoteError>),
    List(Reply<Vec<Item>>, Result<Vec<Item>, RemoteError>),
}

impl ReadyReply {
    /// Hand the result to the waiting client. A caller that went away is ignored.
    fn send(self) {
        let _ = match self {
            Self::Create(tx, result) => tx.send(result).map_err(drop),
            Self::Delete(tx, result) => tx.send(result).map_err(drop),
            Self::List(tx, result) => tx.send(result).map_err(drop),
        };
    }
}

struct Subscription {
    id: u64,
    client: ClientId,
    owner: OwnerId,
    kinds: Vec<ChangeKind>,
    tx: UnboundedSender<Result<ChangeEvent, FeedError>>,
}

struct ServerState {
    items: BTreeMap<ItemId, Item>,
    next_id: u64,
    next_leak: u64,
    epoch: DateTime<Utc>,
    round: u64,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
    calls: VecDeque<QueuedCall>,
    next_call: u64,
    ready: BTreeMap<u64, ReadyReply>,
    feed_log: BTreeMap<ClientId, Vec<ChangeEvent>>,
    failure_percent: u8,
    list_failure_percent: u8,
}

impl ServerState {
    fn owned_by(&self, owner: &OwnerId) -> Vec<Item> {
        let mut items: Vec<Item> = self
            .items
            .values()
            .filter(|item| &item.owner_id == owner)
            .cloned()
            .collect();
        items.sort_by(Item::display_cmp);
        items
    }

    fn prune(&mut self) {
        self.subscriptions.retain(|sub| !sub.tx.is_closed());
    }

    fn now(&self) -> DateTime<Utc> {
        let secs = i64::try_from(self.round).unwrap_or(i64::MAX);
        self.epoch + Duration::seconds(secs)
    }
}

/// Shared handle to the simulated store.
#[derive(Clone)]
pub struct SimServer {
    state: Rc<RefCell<ServerState>>,
}

impl SimServer {
    #[must_use]
    /// `failure_percent` applies to creates and deletes,
    /// `list_failure_percent` to listings.
    pub fn new(failure_percent: u8, list_failure_percent: u8) -> Self {
        let epoch = Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH);
        Self {
            state: Rc::new(RefCell::new(ServerState {
                items: BTreeMap::new(),
                next_id: 1,
                next_leak: 1,
                epoch,
                round: 0,
                subscriptions: Vec::new(),
                next_subscription: 1,
                calls: VecDeque::new(),
                next_call: 1,
                ready: BTreeMap::new(),
                feed_log: BTreeMap::new(),
                failure_percent,
                list_failure_percent,
            })),
        }
    }

    /// A client authenticated as `caller`.
    #[must_use]
    pub fn client(&self, client: ClientId, caller: OwnerId) -> SimRemote {
        SimRemote {
            server: self.clone(),
            client,
            caller,
        }
    }

    /// Stop injecting call failures.
    pub fn settle(&self) {
        let mut state = self.state.borrow_mut();
        state.failure_percent = 0;
        state.list_failure_percent = 0;
    }

    #[must_use]
    pub fn items_for(&self, owner: &OwnerId) -> Vec<Item> {
        self.state.borrow().owned_by(owner)
    }

    /// Feed events actually handed to `client`'s subscriptions, in arrival order.
    #[must_use]
    pub fn feed_log(&self, client: ClientId) -> Vec<ChangeEvent> {
        self.state
            .borrow()
            .feed_log
            .get(&client)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn queued_calls(&self) -> usize {
        self.state.borrow().calls.len()
    }

    #[must_use]
    pub fn live_subscriptions(&self) -> usize {
        let mut state = self.state.borrow_mut();
        state.prune();
        state.subscriptions.len()
    }

    /// Process every call queued before this round started.
    pub fn process_calls(
        &self,
        round: u64,
        network: &mut SimulatedNetwork,
        rng: &mut DeterministicRng,
        trace: &mut Vec<TraceEvent>,
    ) {
        let mut state = self.state.borrow_mut();
        state.round = round;
        state.prune();
        let batch: Vec<QueuedCall> = state.calls.drain(..).collect();

        for QueuedCall {
            client,
            caller,
            request,
        } in batch
        {
            let rate = match request {
                Request::List { .. } => state.list_failure_percent,
                Request::Create { .. } | Request::Delete { .. } => state.failure_percent,
            };
            let failed = rng.hit_rate_percent(rate);
            let (op, outcome, ready, committed) = match request {
                Request::Create { owner, draft, reply } => {
                    let (outcome, result, committed) = if failed {
                        (CallOutcome::Failed, Err(injected(CallOp::Create)), None)
                    } else if owner != caller {
                        let err = RemoteError::rejected(format!(
                            "caller {caller} may not create items for {owner}"
                        ));
                        (CallOutcome::Rejected, Err(err), None)
                    } else {
                        let item = commit(&mut state, &owner, &draft);
                        let event = ChangeEvent::insert(item.clone());
                        (CallOutcome::Committed, Ok(item), Some(event))
                    };
                    (CallOp::Create, outcome, ReadyReply::Create(reply, result), committed)
                }
                Request::Delete { id, reply } => {
                    let (outcome, result, committed) = if failed {
                        (CallOutcome::Failed, Err(injected(CallOp::Delete)), None)
                    } else {
                        match state.items.get(&id).map(|item| item.owner_id.clone()) {
                            None => (CallOutcome::Answered, Ok(()), None),
                            Some(owner) if owner != caller => {
                                let err = RemoteError::rejected(format!(
                                    "caller {caller} may not delete {id}"
                                ));
                                (CallOutcome::Rejected, Err(err), None)
                            }
                            Some(owner) => {
                                state.items.remove(&id);
                                let event = ChangeEvent::delete(owner, id);
                                (CallOutcome::Committed, Ok(()), Some(event))
                            }
                        }
                    };
                    (CallOp::Delete, outcome, ReadyReply::Delete(reply, result), committed)
                }
                Request::List { owner, reply } => {
                    let (outcome, result) = if failed {
                        (CallOutcome::Failed, Err(injected(CallOp::List)))
                    } else if owner != caller {
                        let err = RemoteError::rejected(format!(
                            "caller {caller} may not list items of {owner}"
                        ));
                        (CallOutcome::Rejected, Err(err))
                    } else {
                        (CallOutcome::Answered, Ok(state.owned_by(&owner)))
                    };
                    (CallOp::List, outcome, ReadyReply::List(reply, result), None)
                }
            };

            trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Call {
                    client,
                    op,
                    outcome,
                },
            });

            if let Some(event) = committed {
                publish(&state, &event, round, network, rng, trace);
            }

            let call = state.next_call;
            state.next_call += 1;
            state.ready.insert(call, ready);
            network.send_reliable(
                NetworkMessage {
                    to: client,
                    payload: Payload::Reply { call },
                },
                round,
                rng,
            );
        }
    }

    /// Hand an arrived message to its recipient.
    pub fn deliver(&self, message: NetworkMessage) {
        let mut state = self.state.borrow_mut();
        match message.payload {
            Payload::Reply { call } => {
                let ready = state.ready.remove(&call);
                // Wake the caller after releasing the store.
                drop(state);
                if let Some(ready) = ready {
                    ready.send();
                }
            }
            Payload::Feed {
                subscription,
                event,
            } => {
                let Some(sub) = state
                    .subscriptions
                    .iter()
                    .find(|sub| sub.id == subscription)
                else {
                    trace!(subscription, "feed event for released subscription");
                    return;
                };
                if sub.tx.unbounded_send(Ok(event.clone())).is_ok() {
                    let client = sub.client;
                    state.feed_log.entry(client).or_default().push(event);
                }
            }
        }
    }

    /// Close one live subscription at random, as a server-side disconnect.
    pub fn drop_random_feed(&self, rng: &mut DeterministicRng) -> Option<ClientId> {
        let mut state = self.state.borrow_mut();
        state.prune();
        let index = rng.next_index(state.subscriptions.len())?;
        let sub = state.subscriptions.remove(index);
        let _ = sub
            .tx
            .unbounded_send(Err(FeedError::Closed("subscription dropped by server".into())));
        Some(sub.client)
    }

    /// Push an insert for [`INTRUDER`] to one live subscription at random.
    pub fn leak_foreign_event(
        &self,
        round: u64,
        network: &mut SimulatedNetwork,
        rng: &mut DeterministicRng,
    ) -> Option<ClientId> {
        let mut state = self.state.borrow_mut();
        state.prune();
        let index = rng.next_index(state.subscriptions.len())?;
        let (client, subscription) = {
            let sub = &state.subscriptions[index];
            (sub.client, sub.id)
        };

        let leak = Item {
            id: ItemId::new(format!("x{}", state.next_leak)),
            owner_id: OwnerId::new(INTRUDER),
            title: "not yours".to_string(),
            location: "https://example.invalid/".to_string(),
            created_at: state.now(),
        };
        state.next_leak += 1;
        network.send(
            NetworkMessage {
                to: client,
                payload: Payload::Feed {
                    subscription,
                    event: ChangeEvent::insert(leak),
                },
            },
            round,
            rng,
        );
        Some(client)
    }

    fn enqueue(&self, client: ClientId, caller: &OwnerId, request: Request) {
        self.state.borrow_mut().calls.push_back(QueuedCall {
            client,
            caller: caller.clone(),
            request,
        });
    }

    fn subscribe(
        &self,
        client: ClientId,
        caller: &OwnerId,
        owner: &OwnerId,
        kinds: &[ChangeKind],
    ) -> Result<FeedStream, FeedError> {
        if owner != caller {
            return Err(FeedError::Unavailable(format!(
                "caller {caller} may not subscribe to {owner}"
            )));
        }
        let mut state = self.state.borrow_mut();
        let id = state.next_subscription;
        state.next_subscription += 1;
        let (tx, rx) = mpsc::unbounded();
        state.subscriptions.push(Subscription {
            id,
            client,
            owner: owner.clone(),
            kinds: kinds.to_vec(),
            tx,
        });
        Ok(rx.boxed_local())
    }
}

fn injected(op: CallOp) -> RemoteError {
    RemoteError::unavailable(format!("injected {op:?} failure"))
}

fn commit(state: &mut ServerState, owner: &OwnerId, draft: &NewItem) -> Item {
    let item = Item {
        id: ItemId::new(format!("s{}", state.next_id)),
        owner_id: owner.clone(),
        title: draft.title().to_string(),
        location: draft.location().to_string(),
        created_at: state.now(),
    };
    state.next_id += 1;
    state.items.insert(item.id.clone(), item.clone());
    item
}

fn publish(
    state: &ServerState,
    event: &ChangeEvent,
    round: u64,
    network: &mut SimulatedNetwork,
    rng: &mut DeterministicRng,
    trace: &mut Vec<TraceEvent>,
) {
    for sub in &state.subscriptions {
        if &sub.owner != event.owner_id() || !sub.kinds.contains(&event.kind()) {
            continue;
        }
        let send = network.send(
            NetworkMessage {
                to: sub.client,
                payload: Payload::Feed {
                    subscription: sub.id,
                    event: event.clone(),
                },
            },
            round,
            rng,
        );
        trace.push(TraceEvent {
            round,
            kind: TraceEventKind::FeedSend {
                client: sub.client,
                subscription: sub.id,
                send,
            },
        });
    }
}

/// One client's authenticated connection to a [`SimServer`].
#[derive(Clone)]
pub struct SimRemote {
    server: SimServer,
    client: ClientId,
    caller: OwnerId,
}

impl SimRemote {
    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> Result<T, RemoteError> {
        let (tx, rx) = oneshot::channel();
        self.server.enqueue(self.client, &self.caller, request(tx));
        rx.await
            .unwrap_or_else(|_| Err(RemoteError::unavailable("store dropped the call")))
    }
}

#[async_trait(?Send)]
impl RemoteStore for SimRemote {
    async fn create_item(&self, owner: &OwnerId, draft: &NewItem) -> Result<Item, RemoteError> {
        self.call(|reply| Request::Create {
            owner: owner.clone(),
            draft: draft.clone(),
            reply,
        })
        .await
    }

    async fn delete_item(&self, id: &ItemId) -> Result<(), RemoteError> {
        self.call(|reply| Request::Delete {
            id: id.clone(),
            reply,
        })
        .await
    }

    async fn list_items(&self, owner: &OwnerId) -> Result<Vec<Item>, RemoteError> {
        self.call(|reply| Request::List {
            owner: owner.clone(),
            reply,
        })
        .await
    }

    async fn subscribe(
        &self,
        owner: &OwnerId,
        kinds: &[ChangeKind],
    ) -> Result<FeedStream, FeedError> {
        self.server.subscribe(self.client, &self.caller, owner, kinds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::FaultConfig;
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;

    fn owner(raw: &str) -> OwnerId {
        OwnerId::new(raw)
    }

    /// Run one round: process calls, deliver everything, settle the pool.
    fn round(
        server: &SimServer,
        pool: &mut LocalPool,
        network: &mut SimulatedNetwork,
        rng: &mut DeterministicRng,
        at: u64,
    ) -> Vec<TraceEvent> {
        let mut trace = Vec::new();
        pool.run_until_stalled();
        server.process_calls(at, network, rng, &mut trace);
        for message in network.deliver_ready(at, rng).delivered {
            server.deliver(message);
        }
        pool.run_until_stalled();
        trace
    }

    #[test]
    fn create_is_answered_and_fanned_out_to_owner_only() {
        let server = SimServer::new(0, 0);
        let mut network = SimulatedNetwork::new(FaultConfig::calm(0));
        let mut rng = DeterministicRng::new(1);
        let mut pool = LocalPool::new();

        let alice = server.client(0, owner("u1"));
        let other_tab = server.client(1, owner("u1"));
        let bob = server.client(2, owner("u2"));
        let mut feeds = Vec::new();
        for remote in [&alice, &other_tab, &bob] {
            let caller = remote.caller.clone();
            feeds.push(
                futures::executor::block_on(remote.subscribe(&caller, &ChangeKind::ALL))
                    .expect("subscribe"),
            );
        }

        let result = Rc::new(RefCell::new(None));
        {
            let result = Rc::clone(&result);
            let draft = NewItem::parse("t", "https://example.com").expect("valid");
            pool.spawner()
                .spawn_local(async move {
                    *result.borrow_mut() = Some(alice.create_item(&owner("u1"), &draft).await);
                })
                .expect("spawn");
        }
        let trace = round(&server, &mut pool, &mut network, &mut rng, 0);

        let created = result.borrow_mut().take().expect("answered").expect("created");
        assert_eq!(created.id.as_str(), "s1");
        assert_eq!(server.feed_log(0).len(), 1);
        assert_eq!(server.feed_log(1).len(), 1);
        assert!(server.feed_log(2).is_empty());
        assert!(trace.iter().any(|event| matches!(
            event.kind,
            TraceEventKind::Call {
                op: CallOp::Create,
                outcome: CallOutcome::Committed,
                ..
            }
        )));
        drop(feeds);
        assert_eq!(server.live_subscriptions(), 0);
    }

    #[test]
    fn calls_wait_for_the_server_round() {
        let server = SimServer::new(0, 0);
        let remote = server.client(0, owner("u1"));
        let mut pool = LocalPool::new();
        let done = Rc::new(RefCell::new(false));
        {
            let done = Rc::clone(&done);
            pool.spawner()
                .spawn_local(async move {
                    let _ = remote.list_items(&owner("u1")).await;
                    *done.borrow_mut() = true;
                })
                .expect("spawn");
        }
        pool.run_until_stalled();
        assert!(!*done.borrow());
        assert_eq!(server.queued_calls(), 1);

        let mut network = SimulatedNetwork::new(FaultConfig::calm(0));
        let mut rng = DeterministicRng::new(2);
        round(&server, &mut pool, &mut network, &mut rng, 1);
        assert!(*done.borrow());
    }

    #[test]
    fn full_failure_rate_commits_nothing() {
        let server = SimServer::new(100, 100);
        let remote = server.client(0, owner("u1"));
        let mut pool = LocalPool::new();
        let result = Rc::new(RefCell::new(None));
        {
            let result = Rc::clone(&result);
            let draft = NewItem::parse("t", "https://example.com").expect("valid");
            pool.spawner()
                .spawn_local(async move {
                    *result.borrow_mut() = Some(remote.create_item(&owner("u1"), &draft).await);
                })
                .expect("spawn");
        }
        let mut network = SimulatedNetwork::new(FaultConfig::calm(0));
        let mut rng = DeterministicRng::new(3);
        round(&server, &mut pool, &mut network, &mut rng, 0);

        assert!(matches!(*result.borrow(), Some(Err(_))));
        assert!(server.items_for(&owner("u1")).is_empty());
    }

    #[test]
    fn foreign_subscribe_is_refused() {
        let server = SimServer::new(0, 0);
        let remote = server.client(0, owner("u1"));
        let result = futures::executor::block_on(remote.subscribe(&owner("u2"), &ChangeKind::ALL));
        assert!(matches!(result, Err(FeedError::Unavailable(_))));
    }

    #[test]
    fn dropped_feed_yields_error_then_ends() {
        let server = SimServer::new(0, 0);
        let remote = server.client(4, owner("u1"));
        let mut rng = DeterministicRng::new(4);
        let mut feed = futures::executor::block_on(remote.subscribe(&owner("u1"), &ChangeKind::ALL))
            .expect("subscribe");

        assert_eq!(server.drop_random_feed(&mut rng), Some(4));
        let first = futures::executor::block_on(feed.next());
        assert!(matches!(first, Some(Err(FeedError::Closed(_)))));
        assert!(futures::executor::block_on(feed.next()).is_none());
        assert_eq!(server.drop_random_feed(&mut rng), None);
    }
}
