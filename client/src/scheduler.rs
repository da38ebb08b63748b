use crate::semaphore::{Reservation, ResourceGate, SlotPermit, Slots};
use ember_world::{Store, World};
use futures::future::BoxFuture;
use ember_types::Notification;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub type ActionId = u64;

/// Every user-intended mutation kind, with its static scheduling priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    MineTile,
    HarvestTile,
    UpgradeTile,
    RaiseWall,
    RazeWall,
    SpawnCreature,
    MoveCreature,
}

impl ActionKind {
    /// Static priority table; higher runs first. No ordering is promised
    /// between equal-priority actions.
    pub fn priority(self) -> u8 {
        match self {
            ActionKind::RaiseWall => 60,
            ActionKind::RazeWall => 55,
            ActionKind::MineTile => 50,
            ActionKind::SpawnCreature => 45,
            ActionKind::HarvestTile => 40,
            ActionKind::MoveCreature => 35,
            ActionKind::UpgradeTile => 30,
        }
    }
}

/// Resource budgets actions draw from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Gold,
    Souls,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionState {
    Queued,
    Scheduled,
    /// Running; no longer cancellable.
    Processing,
    Done,
    Failed,
    Cancelled,
}

/// Async admission predicate, re-evaluated after waits that suspended.
pub type Requirement = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;
/// Synchronous "already satisfied" check; a true result auto-completes.
pub type SkipCheck = Box<dyn Fn(&World) -> bool + Send + Sync>;
/// The action's effect, run exactly once in the Processing state.
pub type ActionBody = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    pub cost: BTreeMap<ResourceKind, u64>,
    pub requirement: Option<Requirement>,
    pub skip: Option<SkipCheck>,
    pub body: ActionBody,
    pub children: Vec<ActionId>,
    pub ignore_concurrency: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_global_slots")]
    pub global_slots: usize,
    #[serde(default = "default_per_kind_slots")]
    pub per_kind_slots: usize,
}

fn default_global_slots() -> usize {
    8
}

fn default_per_kind_slots() -> usize {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_slots: default_global_slots(),
            per_kind_slots: default_per_kind_slots(),
        }
    }
}

struct Entry {
    kind: ActionKind,
    cost: BTreeMap<ResourceKind, u64>,
    requirement: Option<Requirement>,
    skip: Option<SkipCheck>,
    body: Option<ActionBody>,
    children: Vec<ActionId>,
    ignore_concurrency: bool,
    state: ActionState,
    seq: u64,
}

struct SchedState {
    actions: HashMap<ActionId, Entry>,
    next_seq: u64,
}

struct SchedInner {
    store: Store,
    state: Mutex<SchedState>,
    global: Slots,
    per_kind: HashMap<ActionKind, Slots>,
    gates: Mutex<HashMap<ResourceKind, Arc<ResourceGate>>>,
}

/// The action scheduler: admits queued actions under concurrency and live
/// resource constraints, in static priority order.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedInner>,
}

const ALL_KINDS: [ActionKind; 7] = [
    ActionKind::MineTile,
    ActionKind::HarvestTile,
    ActionKind::UpgradeTile,
    ActionKind::RaiseWall,
    ActionKind::RazeWall,
    ActionKind::SpawnCreature,
    ActionKind::MoveCreature,
];

impl Scheduler {
    pub fn new(store: Store, config: SchedulerConfig) -> Self {
        let per_kind = ALL_KINDS
            .into_iter()
            .map(|kind| (kind, Slots::new(config.per_kind_slots)))
            .collect();
        Self {
            inner: Arc::new(SchedInner {
                store,
                state: Mutex::new(SchedState {
                    actions: HashMap::new(),
                    next_seq: 0,
                }),
                global: Slots::new(config.global_slots),
                per_kind,
                gates: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn register_gate(&self, resource: ResourceKind, gate: Arc<ResourceGate>) {
        self.inner
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(resource, gate);
    }

    /// Insert and immediately attempt admission. A duplicate id is a no-op.
    pub fn add(&self, action: Action) {
        {
            let mut state = self.inner.lock_state();
            if state.actions.contains_key(&action.id) {
                warn!(id = action.id, "duplicate action id; ignoring");
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.actions.insert(
                action.id,
                Entry {
                    kind: action.kind,
                    cost: action.cost,
                    requirement: action.requirement,
                    skip: action.skip,
                    body: Some(action.body),
                    children: action.children,
                    ignore_concurrency: action.ignore_concurrency,
                    state: ActionState::Queued,
                    seq,
                },
            );
        }
        self.process(None);
    }

    /// Cancel a Queued or Scheduled action, cascading to recorded children.
    /// Cancelling a Processing action is a no-op.
    pub fn cancel(&self, id: ActionId) {
        let mut state = self.inner.lock_state();
        cancel_cascade(&mut state, &[id]);
    }

    pub fn state(&self, id: ActionId) -> Option<ActionState> {
        self.inner
            .lock_state()
            .actions
            .get(&id)
            .map(|entry| entry.state)
    }

    /// Scan Queued actions in priority order and admit what fits.
    pub fn process(&self, filter: Option<ActionKind>) {
        let mut candidates: Vec<(Reverse<u8>, u64, ActionId)> = {
            let state = self.inner.lock_state();
            state
                .actions
                .iter()
                .filter(|(_, entry)| entry.state == ActionState::Queued)
                .filter(|(_, entry)| filter.map_or(true, |kind| entry.kind == kind))
                .map(|(id, entry)| (Reverse(entry.kind.priority()), entry.seq, *id))
                .collect()
        };
        candidates.sort();
        for (_, _, id) in candidates {
            self.try_admit(id);
        }
    }

    /// Listen for world changes: poke gates whose dependency changed and
    /// re-run admission, so Queued waiters track live capacity.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        let mut notifications = scheduler.inner.store.subscribe();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(Notification::PlayerChanged(address)) => {
                        for gate in scheduler.gates() {
                            if gate.depends_on(&address) {
                                gate.poke();
                            }
                        }
                        scheduler.process(None);
                    }
                    Ok(Notification::Loading { .. }) => {}
                    Ok(_) => scheduler.process(None),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "scheduler lagged on notifications");
                        scheduler.process(None);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn gates(&self) -> Vec<Arc<ResourceGate>> {
        self.inner
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn gates_by_kind(&self) -> HashMap<ResourceKind, Arc<ResourceGate>> {
        self.inner
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn try_admit(&self, id: ActionId) {
        let gates = self.gates_by_kind();
        {
            let mut state = self.inner.lock_state();
            let Some(entry) = state.actions.get_mut(&id) else {
                return;
            };
            if entry.state != ActionState::Queued {
                return;
            }
            // Already-satisfied actions complete without executing.
            if let Some(skip) = &entry.skip {
                if self.inner.store.read(|world| skip(world)) {
                    debug!(id, "action already satisfied; auto-completing");
                    entry.state = ActionState::Done;
                    return;
                }
            }
            if !entry.ignore_concurrency {
                if let Some(slots) = self.inner.per_kind.get(&entry.kind) {
                    if slots.is_full() {
                        return;
                    }
                }
                // All-or-nothing: every cost must fit its gate's current
                // headroom or the action stays Queued.
                for (resource, amount) in &entry.cost {
                    if let Some(gate) = gates.get(resource) {
                        if gate.available(&self.inner.store) < *amount {
                            return;
                        }
                    }
                }
            }
            entry.state = ActionState::Scheduled;
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            execute(scheduler, id).await;
        });
    }

    fn revert_to_queued(&self, id: ActionId) {
        let mut state = self.inner.lock_state();
        if let Some(entry) = state.actions.get_mut(&id) {
            if entry.state == ActionState::Scheduled {
                entry.state = ActionState::Queued;
            }
        }
    }

    fn is_cancelled(&self, id: ActionId) -> bool {
        matches!(self.state(id), Some(ActionState::Cancelled) | None)
    }
}

impl SchedInner {
    fn lock_state(&self) -> MutexGuard<'_, SchedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn cancel_cascade(state: &mut SchedState, ids: &[ActionId]) {
    for id in ids {
        let children = match state.actions.get_mut(id) {
            Some(entry)
                if matches!(entry.state, ActionState::Queued | ActionState::Scheduled) =>
            {
                entry.state = ActionState::Cancelled;
                debug!(id, "action cancelled");
                entry.children.clone()
            }
            _ => continue,
        };
        cancel_cascade(state, &children);
    }
}

async fn execute(scheduler: Scheduler, id: ActionId) {
    let inner = &scheduler.inner;
    let (kind, cost, ignore_concurrency, requirement) = {
        let state = inner.lock_state();
        let Some(entry) = state.actions.get(&id) else {
            return;
        };
        if entry.state != ActionState::Scheduled {
            return;
        }
        (
            entry.kind,
            entry.cost.clone(),
            entry.ignore_concurrency,
            entry.requirement.clone(),
        )
    };

    // Dynamic requirement: evaluate before claiming anything; execute only
    // if nothing claimed the action in the meantime.
    if let Some(requirement) = &requirement {
        if !requirement().await {
            scheduler.revert_to_queued(id);
            return;
        }
        if scheduler.is_cancelled(id) {
            return;
        }
    }

    // Acquire the global slot, the per-kind slot, and every resource gate,
    // in declaration order. Held guards release on drop, whatever path
    // exits this function.
    let mut waited = false;
    let mut permits: Vec<SlotPermit> = Vec::new();
    let mut reservations: Vec<Reservation> = Vec::new();
    if !ignore_concurrency {
        match inner.global.try_acquire() {
            Some(permit) => permits.push(permit),
            None => {
                waited = true;
                permits.push(inner.global.acquire().await);
            }
        }
        if scheduler.is_cancelled(id) {
            return;
        }
        if let Some(slots) = inner.per_kind.get(&kind) {
            match slots.try_acquire() {
                Some(permit) => permits.push(permit),
                None => {
                    waited = true;
                    permits.push(slots.acquire().await);
                }
            }
            if scheduler.is_cancelled(id) {
                return;
            }
        }
        let gates = scheduler.gates_by_kind();
        for (resource, amount) in &cost {
            let Some(gate) = gates.get(resource) else {
                continue;
            };
            match gate.try_reserve(&inner.store, *amount) {
                Some(reservation) => reservations.push(reservation),
                None => {
                    waited = true;
                    reservations.push(gate.reserve(&inner.store, *amount).await);
                }
            }
            if scheduler.is_cancelled(id) {
                return;
            }
        }
    }

    // If any acquisition suspended, the world may have moved underneath the
    // original admission check: re-evaluate the requirement once. Failing
    // it here is a revert, not a failure.
    if waited {
        if let Some(requirement) = &requirement {
            if !requirement().await {
                drop(permits);
                drop(reservations);
                scheduler.revert_to_queued(id);
                scheduler.process(None);
                return;
            }
        }
        if scheduler.is_cancelled(id) {
            return;
        }
    }

    let body = {
        let mut state = inner.lock_state();
        let Some(entry) = state.actions.get_mut(&id) else {
            return;
        };
        if entry.state != ActionState::Scheduled {
            return;
        }
        entry.state = ActionState::Processing;
        entry.body.take()
    };
    let Some(body) = body else {
        warn!(id, "action body missing");
        return;
    };

    let result = body().await;
    {
        let mut state = inner.lock_state();
        let children = match state.actions.get_mut(&id) {
            Some(entry) => match &result {
                Ok(()) => {
                    entry.state = ActionState::Done;
                    Vec::new()
                }
                Err(err) => {
                    warn!(id, %err, "action failed");
                    entry.state = ActionState::Failed;
                    entry.children.clone()
                }
            },
            None => Vec::new(),
        };
        // A failure cascades cancellation to recorded children.
        cancel_cascade(&mut state, &children);
    }
    drop(permits);
    drop(reservations);
    scheduler.process(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::GateScope;
    use ember_types::{Address, DecodedEvent, EventBody, TxHash};
    use ember_world::WorldConfig;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    const PLAYER: Address = Address([1; 20]);

    fn store_with_gold(gold: u64) -> Store {
        let store = Store::new(WorldConfig::default());
        let mut world = ember_world::World::new(WorldConfig::default());
        world.players.insert(
            PLAYER,
            ember_types::Player {
                address: PLAYER,
                gold,
                souls: 0,
                gold_capacity: 1_000,
                joined_at: 0,
                last_action_at: 0,
            },
        );
        store.install(world);
        store
    }

    fn gold_gate() -> Arc<ResourceGate> {
        ResourceGate::new(
            "gold",
            GateScope::Player(PLAYER),
            Box::new(|world| world.players.get(&PLAYER).map(|p| p.gold).unwrap_or(0)),
        )
    }

    fn set_gold(store: &Store, gold: u64) {
        store
            .apply(&DecodedEvent {
                block_number: 1,
                log_index: 0,
                tx_hash: TxHash([0; 32]),
                emitter: Address([9; 20]),
                body: EventBody::PlayerVaultChanged {
                    address: PLAYER,
                    gold,
                    souls: 0,
                },
            })
            .unwrap();
    }

    struct TestAction {
        id: ActionId,
        kind: ActionKind,
        cost: Vec<(ResourceKind, u64)>,
        children: Vec<ActionId>,
        hold: Option<Arc<Notify>>,
        fail: bool,
    }

    impl TestAction {
        fn new(id: ActionId) -> Self {
            Self {
                id,
                kind: ActionKind::MineTile,
                cost: Vec::new(),
                children: Vec::new(),
                hold: None,
                fail: false,
            }
        }

        fn build(self, runs: Arc<AtomicU64>) -> Action {
            let hold = self.hold.clone();
            let fail = self.fail;
            Action {
                id: self.id,
                kind: self.kind,
                cost: self.cost.into_iter().collect(),
                requirement: None,
                skip: None,
                body: Box::new(move || {
                    Box::pin(async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        if let Some(hold) = hold {
                            hold.notified().await;
                        }
                        if fail {
                            anyhow::bail!("scripted failure");
                        }
                        Ok(())
                    })
                }),
                children: self.children,
                ignore_concurrency: false,
            }
        }
    }

    async fn wait_for_state(scheduler: &Scheduler, id: ActionId, want: ActionState) {
        timeout(Duration::from_secs(5), async {
            loop {
                if scheduler.state(id) == Some(want) {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "action {id} never reached {want:?} (got {:?})",
                scheduler.state(id)
            )
        });
    }

    #[tokio::test]
    async fn insufficient_capacity_keeps_action_queued_until_state_rises() {
        let store = store_with_gold(30);
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        scheduler.register_gate(ResourceKind::Gold, gold_gate());
        let listener = scheduler.start();

        let runs = Arc::new(AtomicU64::new(0));
        let mut action = TestAction::new(1);
        action.cost = vec![(ResourceKind::Gold, 50)];
        scheduler.add(action.build(runs.clone()));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.state(1), Some(ActionState::Queued));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // A live state update raises capacity; no new add() call needed.
        set_gold(&store, 60);
        wait_for_state(&scheduler, 1, ActionState::Done).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        listener.abort();
    }

    #[tokio::test]
    async fn admission_never_overcommits_a_resource() {
        let store = store_with_gold(100);
        let scheduler = Scheduler::new(
            store.clone(),
            SchedulerConfig {
                global_slots: 8,
                per_kind_slots: 8,
            },
        );
        let gate = gold_gate();
        scheduler.register_gate(ResourceKind::Gold, gate.clone());

        let runs = Arc::new(AtomicU64::new(0));
        let hold = Arc::new(Notify::new());
        for id in 1..=3 {
            let mut action = TestAction::new(id);
            action.cost = vec![(ResourceKind::Gold, 60)];
            action.hold = Some(hold.clone());
            scheduler.add(action.build(runs.clone()));
        }

        // Only one 60-gold reservation fits in 100.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(gate.in_use() <= 100);

        // Completion releases the reservation and admits the next.
        hold.notify_waiters();
        timeout(Duration::from_secs(5), async {
            while runs.load(Ordering::SeqCst) < 2 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(gate.in_use() <= 100);
    }

    #[tokio::test]
    async fn cancel_cascades_to_children_but_not_processing() {
        let store = store_with_gold(0);
        let scheduler = Scheduler::new(store, SchedulerConfig::default());

        let runs = Arc::new(AtomicU64::new(0));
        let hold = Arc::new(Notify::new());

        // Parent is running (Processing); its children are queued behind the
        // single MineTile slot.
        let mut parent = TestAction::new(1);
        parent.hold = Some(hold.clone());
        parent.children = vec![2, 3];
        scheduler.add(parent.build(runs.clone()));
        wait_for_state(&scheduler, 1, ActionState::Processing).await;

        scheduler.add(TestAction::new(2).build(runs.clone()));
        scheduler.add(TestAction::new(3).build(runs.clone()));

        // Cancelling the Processing parent is a no-op.
        scheduler.cancel(1);
        assert_eq!(scheduler.state(1), Some(ActionState::Processing));

        // Cancelling a queued child cascades nowhere else here, but a
        // queued parent cancels its recorded children.
        scheduler.cancel(2);
        assert_eq!(scheduler.state(2), Some(ActionState::Cancelled));

        hold.notify_waiters();
        wait_for_state(&scheduler, 1, ActionState::Done).await;
        wait_for_state(&scheduler, 3, ActionState::Done).await;
    }

    #[tokio::test]
    async fn queued_parent_cancel_reaches_children() {
        let store = store_with_gold(0);
        let scheduler = Scheduler::new(store, SchedulerConfig::default());

        let runs = Arc::new(AtomicU64::new(0));
        let hold = Arc::new(Notify::new());

        // Occupy the MineTile slot so everything else stays Queued.
        let mut blocker = TestAction::new(10);
        blocker.hold = Some(hold.clone());
        scheduler.add(blocker.build(runs.clone()));
        wait_for_state(&scheduler, 10, ActionState::Processing).await;

        let mut parent = TestAction::new(1);
        parent.children = vec![2];
        scheduler.add(parent.build(runs.clone()));
        let mut child = TestAction::new(2);
        child.children = vec![3];
        scheduler.add(child.build(runs.clone()));
        scheduler.add(TestAction::new(3).build(runs.clone()));

        scheduler.cancel(1);
        assert_eq!(scheduler.state(1), Some(ActionState::Cancelled));
        assert_eq!(scheduler.state(2), Some(ActionState::Cancelled));
        assert_eq!(scheduler.state(3), Some(ActionState::Cancelled));

        hold.notify_waiters();
        wait_for_state(&scheduler, 10, ActionState::Done).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_marks_failed_and_cancels_children() {
        let store = store_with_gold(0);
        let scheduler = Scheduler::new(store, SchedulerConfig::default());

        let runs = Arc::new(AtomicU64::new(0));
        let hold = Arc::new(Notify::new());

        let mut blocker = TestAction::new(10);
        blocker.hold = Some(hold.clone());
        blocker.kind = ActionKind::RazeWall;
        scheduler.add(blocker.build(runs.clone()));
        wait_for_state(&scheduler, 10, ActionState::Processing).await;

        let mut parent = TestAction::new(1);
        parent.fail = true;
        parent.children = vec![2];
        scheduler.add(parent.build(runs.clone()));
        let mut child = TestAction::new(2);
        child.kind = ActionKind::RazeWall;
        scheduler.add(child.build(runs.clone()));

        wait_for_state(&scheduler, 1, ActionState::Failed).await;
        assert_eq!(scheduler.state(2), Some(ActionState::Cancelled));

        hold.notify_waiters();
        wait_for_state(&scheduler, 10, ActionState::Done).await;
    }

    #[tokio::test]
    async fn duplicate_ids_are_ignored() {
        let store = store_with_gold(0);
        let scheduler = Scheduler::new(store, SchedulerConfig::default());

        let runs = Arc::new(AtomicU64::new(0));
        let hold = Arc::new(Notify::new());
        let mut first = TestAction::new(1);
        first.hold = Some(hold.clone());
        scheduler.add(first.build(runs.clone()));
        wait_for_state(&scheduler, 1, ActionState::Processing).await;

        scheduler.add(TestAction::new(1).build(runs.clone()));
        hold.notify_waiters();
        wait_for_state(&scheduler, 1, ActionState::Done).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn satisfied_actions_auto_complete() {
        let store = store_with_gold(0);
        let scheduler = Scheduler::new(store, SchedulerConfig::default());

        let runs = Arc::new(AtomicU64::new(0));
        let runs_inner = runs.clone();
        scheduler.add(Action {
            id: 1,
            kind: ActionKind::RaiseWall,
            cost: BTreeMap::new(),
            requirement: None,
            skip: Some(Box::new(|_| true)),
            body: Box::new(move || {
                Box::pin(async move {
                    runs_inner.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
            children: Vec::new(),
            ignore_concurrency: false,
        });

        assert_eq!(scheduler.state(1), Some(ActionState::Done));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_requirement_reverts_to_queued() {
        let store = store_with_gold(0);
        let scheduler = Scheduler::new(store, SchedulerConfig::default());

        let runs = Arc::new(AtomicU64::new(0));
        let runs_inner = runs.clone();
        scheduler.add(Action {
            id: 1,
            kind: ActionKind::SpawnCreature,
            cost: BTreeMap::new(),
            requirement: Some(Arc::new(|| Box::pin(async { false }))),
            skip: None,
            body: Box::new(move || {
                Box::pin(async move {
                    runs_inner.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
            children: Vec::new(),
            ignore_concurrency: false,
        });

        wait_for_state(&scheduler, 1, ActionState::Queued).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn higher_priority_kinds_admit_first() {
        let store = store_with_gold(100);
        let scheduler = Scheduler::new(
            store.clone(),
            SchedulerConfig {
                global_slots: 8,
                per_kind_slots: 8,
            },
        );
        let gate = gold_gate();
        scheduler.register_gate(ResourceKind::Gold, gate);

        // Both want the full budget; only the higher-priority RaiseWall
        // fits, despite being added second.
        let order: Arc<Mutex<Vec<ActionId>>> = Arc::new(Mutex::new(Vec::new()));
        let build = |id: ActionId, kind: ActionKind| {
            let order = order.clone();
            Action {
                id,
                kind,
                cost: [(ResourceKind::Gold, 100)].into_iter().collect(),
                requirement: None,
                skip: None,
                body: Box::new(move || {
                    Box::pin(async move {
                        order.lock().unwrap().push(id);
                        Ok(())
                    })
                }),
                children: Vec::new(),
                ignore_concurrency: false,
            }
        };

        // Seed them Queued while nothing can run, then process once.
        {
            let mut state = scheduler.inner.lock_state();
            for (id, kind) in [(1, ActionKind::UpgradeTile), (2, ActionKind::RaiseWall)] {
                let action = build(id, kind);
                let seq = state.next_seq;
                state.next_seq += 1;
                state.actions.insert(
                    id,
                    Entry {
                        kind: action.kind,
                        cost: action.cost,
                        requirement: None,
                        skip: None,
                        body: Some(action.body),
                        children: Vec::new(),
                        ignore_concurrency: false,
                        state: ActionState::Queued,
                        seq,
                    },
                );
            }
        }
        scheduler.process(None);
        wait_for_state(&scheduler, 2, ActionState::Done).await;
        wait_for_state(&scheduler, 1, ActionState::Done).await;
        assert_eq!(order.lock().unwrap().first(), Some(&2));
    }
}
