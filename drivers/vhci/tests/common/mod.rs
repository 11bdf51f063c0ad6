//! Shared mocks for the broker integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use vhci_broker::{
    Broker, BrokerConfig, CallerOp, ConsumerOp, Error, OpId, OpStatus, PoolConfig, Request,
    RequestPool, RequestStore, Result, StoreProgress, Transfer,
};

// =============================================================================
// Journal
// =============================================================================

/// Everything the environment and the transport observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    MarkPending(u64),
    RegisterCancel(u64),
    ReleaseCancel(u64),
    CallerCompleted(u64, OpStatus),
    ConsumerCompleted(u32, OpStatus),
    Stored {
        seq_num: u64,
        op: Option<u64>,
        unlink: Option<u64>,
    },
}

#[derive(Debug, Default)]
pub struct Journal {
    events: Mutex<Vec<Event>>,
}

impl Journal {
    pub fn push(&self, event: Event) {
        self.events.lock().expect("journal poisoned").push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("journal poisoned").clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    /// Completion status of a caller, if it was completed
    pub fn caller_status(&self, op: u64) -> Option<OpStatus> {
        self.events().iter().find_map(|e| match e {
            Event::CallerCompleted(id, status) if *id == op => Some(*status),
            _ => None,
        })
    }

    pub fn consumer_status(&self, consumer: u32) -> Option<OpStatus> {
        self.events().iter().find_map(|e| match e {
            Event::ConsumerCompleted(id, status) if *id == consumer => Some(*status),
            _ => None,
        })
    }

    /// (seq, op, unlink) of every store call, in order
    pub fn stored(&self) -> Vec<(u64, Option<u64>, Option<u64>)> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::Stored {
                    seq_num,
                    op,
                    unlink,
                } => Some((*seq_num, *op, *unlink)),
                _ => None,
            })
            .collect()
    }
}

// =============================================================================
// Caller and consumer operations
// =============================================================================

#[derive(Debug)]
pub struct MockCaller {
    pub id: u64,
    pub transfer: Option<Transfer>,
    pub journal: Arc<Journal>,
}

impl MockCaller {
    pub fn new(id: u64, journal: &Arc<Journal>) -> Self {
        Self {
            id,
            transfer: None,
            journal: Arc::clone(journal),
        }
    }

    pub fn with_transfer(mut self, transfer: Transfer) -> Self {
        self.transfer = Some(transfer);
        self
    }
}

impl CallerOp for MockCaller {
    fn id(&self) -> OpId {
        OpId(self.id)
    }

    fn mark_pending(&mut self) {
        self.journal.push(Event::MarkPending(self.id));
    }

    fn register_cancel(&mut self) {
        self.journal.push(Event::RegisterCancel(self.id));
    }

    fn release_cancel_registration(&mut self) {
        self.journal.push(Event::ReleaseCancel(self.id));
    }

    fn complete(self, status: OpStatus) {
        self.journal.push(Event::CallerCompleted(self.id, status));
    }

    fn transfer(&self) -> Option<Transfer> {
        self.transfer
    }
}

#[derive(Debug)]
pub struct MockConsumer {
    pub id: u32,
    pub journal: Arc<Journal>,
}

impl MockConsumer {
    pub fn new(id: u32, journal: &Arc<Journal>) -> Self {
        Self {
            id,
            journal: Arc::clone(journal),
        }
    }
}

impl ConsumerOp for MockConsumer {
    fn complete(self, status: OpStatus) {
        self.journal.push(Event::ConsumerCompleted(self.id, status));
    }
}

// =============================================================================
// Store
// =============================================================================

pub type StoreHook = Box<dyn Fn(&Request<MockCaller>) + Send + Sync>;

/// Scripted transport: pops one outcome per call, `Complete` once empty
pub struct MockStore {
    pub journal: Arc<Journal>,
    pub script: Arc<Mutex<VecDeque<Result<StoreProgress>>>>,
    pub hook: Option<StoreHook>,
}

impl RequestStore<MockCaller, MockConsumer> for MockStore {
    fn store(
        &self,
        request: &Request<MockCaller>,
        _consumer: &mut MockConsumer,
    ) -> Result<StoreProgress> {
        if let Some(hook) = &self.hook {
            hook(request);
        }

        let outcome = self
            .script
            .lock()
            .expect("script poisoned")
            .pop_front()
            .unwrap_or(Ok(StoreProgress::Complete));

        if outcome.is_ok() {
            self.journal.push(Event::Stored {
                seq_num: request.seq_num(),
                op: request.op_id().map(|id| id.0),
                unlink: request.unlink_target(),
            });
        }
        outcome
    }
}

// =============================================================================
// Fixture
// =============================================================================

pub type TestBroker = Broker<MockCaller, MockConsumer, MockStore>;

pub struct Fixture {
    pub broker: Arc<TestBroker>,
    pub pool: Arc<RequestPool<MockCaller>>,
    pub journal: Arc<Journal>,
    pub script: Arc<Mutex<VecDeque<Result<StoreProgress>>>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(64, None)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    pub fn with_hook(hook: StoreHook) -> Self {
        Self::build(64, Some(hook))
    }

    /// Build a fixture whose store hook can call back into the broker
    pub fn with_broker_hook<F>(hook: F) -> Self
    where
        F: Fn(&TestBroker, &Arc<Journal>, &Request<MockCaller>) + Send + Sync + 'static,
    {
        let cell: Arc<OnceLock<(Weak<TestBroker>, Arc<Journal>)>> = Arc::new(OnceLock::new());
        let hook_cell = Arc::clone(&cell);
        let fx = Self::with_hook(Box::new(move |request: &Request<MockCaller>| {
            if let Some((broker, journal)) = hook_cell.get() {
                if let Some(broker) = broker.upgrade() {
                    hook(&broker, journal, request);
                }
            }
        }));
        let _ = cell.set((Arc::downgrade(&fx.broker), Arc::clone(&fx.journal)));
        fx
    }

    fn build(capacity: usize, hook: Option<StoreHook>) -> Self {
        let journal = Arc::new(Journal::default());
        let script = Arc::new(Mutex::new(VecDeque::new()));
        let pool_config = PoolConfig::urb_requests(capacity);
        let pool = Arc::new(RequestPool::<MockCaller>::new(pool_config).expect("pool"));
        let store = MockStore {
            journal: Arc::clone(&journal),
            script: Arc::clone(&script),
            hook,
        };
        let broker = Broker::new(
            BrokerConfig::for_pool("test-port", &pool_config),
            Arc::clone(&pool),
            store,
        )
        .expect("broker");

        Self {
            broker: Arc::new(broker),
            pool,
            journal,
            script,
        }
    }

    /// Queue the outcome of the next store call
    pub fn script(&self, outcome: Result<StoreProgress>) {
        self.script.lock().expect("script poisoned").push_back(outcome);
    }

    pub fn caller(&self, id: u64) -> MockCaller {
        MockCaller::new(id, &self.journal)
    }

    pub fn consumer(&self, id: u32) -> MockConsumer {
        MockConsumer::new(id, &self.journal)
    }

    /// Create and submit a request for caller `id`
    pub fn submit(&self, id: u64) {
        let request = self
            .broker
            .create_request(Some(self.caller(id)), None)
            .expect("request");
        self.broker.submit(request).expect("submit");
    }

    /// Park a consumer on an idle broker
    pub fn park(&self, id: u32) {
        assert_eq!(
            self.broker.pull(self.consumer(id)),
            Ok(vhci_broker::Pulled::Parked)
        );
    }

    pub fn store_failure() -> Result<StoreProgress> {
        Err(Error::StoreFailed)
    }
}
