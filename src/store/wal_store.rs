use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use ulid::Ulid;

use crate::daily_limit::LimitsSource;
use crate::limits::*;
use crate::membership::MembershipRegistry;
use crate::model::*;
use crate::wal::Wal;

use super::{BookingRepository, ClassTransaction, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long a transaction waits for a class lock before reporting a conflict.
    pub lock_timeout: Duration,
    /// How long a commit may wait to be scheduled on the WAL before it is dropped.
    pub commit_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            commit_timeout: Duration::from_secs(5),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        deadline: Instant,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends for group commit.
/// An append whose deadline has passed before it reaches the file is answered with
/// `TimedOut` and never written, so a timed-out commit is never durable.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append {
                event,
                deadline,
                response,
            } => {
                let mut batch: Vec<PendingAppend> = Vec::new();
                admit_or_expire(&mut batch, event, deadline, response);

                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append {
                            event,
                            deadline,
                            response,
                        }) => admit_or_expire(&mut batch, event, deadline, response),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    flush_batch(&mut wal, batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                }
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn admit_or_expire(
    batch: &mut Vec<PendingAppend>,
    event: Event,
    deadline: Instant,
    response: oneshot::Sender<io::Result<()>>,
) {
    if Instant::now() >= deadline {
        metrics::counter!(crate::observability::WAL_COMMITS_EXPIRED_TOTAL).increment(1);
        let _ = response.send(Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "commit deadline passed before write",
        )));
    } else {
        batch.push((event, response));
    }
}

/// Write one batch and answer every caller. `Wal::flush_sync` rolls a failed batch
/// back, so each reply matches what a replay will see.
fn flush_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    let mut staged = Vec::with_capacity(batch.len());
    for (event, tx) in batch {
        match wal.append_buffered(&event) {
            Ok(()) => staged.push(tx),
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    }
    if staged.is_empty() {
        return;
    }
    let result = wal.flush_sync();
    if let Err(e) = &result {
        tracing::error!("wal flush failed, {} commits rejected: {e}", staged.len());
    }
    for tx in staged {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append {
            event,
            deadline,
            response,
        } => {
            let mut batch = Vec::with_capacity(1);
            admit_or_expire(&mut batch, event, deadline, response);
            flush_batch(wal, batch);
        }
    }
}

/// Append `event` and, once it is durable, run `publish` against the shared state.
/// Both steps run on their own task that also owns `guard`, so a caller that stops
/// waiting can never leave a durable record unpublished or publish without the lock.
async fn append_then_publish<G, F, Fut>(
    shared: Arc<Shared>,
    event: Event,
    guard: G,
    publish: F,
) -> Result<(), StorageError>
where
    G: Send + 'static,
    F: FnOnce(Arc<Shared>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let _guard = guard;
        shared.wal_append(event).await?;
        publish(shared).await;
        Ok::<(), StorageError>(())
    })
    .await
    .map_err(|e| StorageError::Io(format!("commit task failed: {e}")))?
}

// ── Shared state ─────────────────────────────────────────

struct ClassSlot {
    /// The row lock. Held by a `WalTransaction` until its commit is published.
    lock: Arc<Mutex<()>>,
    /// Last committed state; readers clone the Arc and never wait on the lock.
    committed: Arc<ClassState>,
}

struct Shared {
    organization_id: String,
    classes: DashMap<Ulid, ClassSlot>,
    booking_to_class: DashMap<Ulid, Ulid>,
    /// Member → every class they ever booked; drives daily-limit reads.
    member_classes: DashMap<Ulid, HashSet<Ulid>>,
    wal_tx: mpsc::Sender<WalCommand>,
    commit_timeout: Duration,
}

impl Shared {
    async fn wal_append(&self, event: Event) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.commit_timeout;
        self.wal_tx
            .send(WalCommand::Append {
                event,
                deadline,
                response: tx,
            })
            .await
            .map_err(|_| StorageError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Io("WAL writer dropped response".into()))?
            .map_err(StorageError::from)
    }

    fn index_booking(&self, booking: &Booking) {
        self.booking_to_class.insert(booking.id, booking.class_id);
        self.member_classes
            .entry(booking.member_id)
            .or_default()
            .insert(booking.class_id);
    }

    fn snapshot(&self, class_id: &Ulid) -> Option<Arc<ClassState>> {
        self.classes.get(class_id).map(|s| s.committed.clone())
    }

    fn slot_lock(&self, class_id: &Ulid) -> Option<Arc<Mutex<()>>> {
        self.classes.get(class_id).map(|s| s.lock.clone())
    }

    /// Rebuild state from one WAL record. Replay runs single-threaded before serving.
    fn replay_class_event(&self, event: &Event) {
        match event {
            Event::ClassScheduled { class } => {
                self.classes.insert(
                    class.id,
                    ClassSlot {
                        lock: Arc::new(Mutex::new(())),
                        committed: Arc::new(ClassState::new(class.clone())),
                    },
                );
            }
            Event::ClassCancelled { id } => {
                if let Some(mut slot) = self.classes.get_mut(id) {
                    Arc::make_mut(&mut slot.committed).class.is_cancelled = true;
                }
            }
            Event::ClassCommitted { class_id, changes } => {
                let Some(mut slot) = self.classes.get_mut(class_id) else {
                    tracing::warn!("replay: commit for unknown class {class_id}");
                    return;
                };
                let state = Arc::make_mut(&mut slot.committed);
                for change in changes {
                    state.apply(change);
                }
                drop(slot);
                for change in changes {
                    if let Change::BookingInserted(b) = change {
                        self.index_booking(b);
                    }
                }
            }
            Event::MembershipSet { .. } | Event::LimitsConfigured { .. } => {}
        }
    }
}

// ── Store ────────────────────────────────────────────────

/// WAL-backed booking store for one organization.
pub struct WalStore {
    shared: Arc<Shared>,
    memberships: Arc<MembershipRegistry>,
    limits: Arc<RwLock<OrganizationBookingLimits>>,
    /// Serializes writes that are not scoped to one class (scheduling, memberships,
    /// limits) against each other and against compaction.
    admin: Arc<Mutex<()>>,
    lock_timeout: Duration,
}

impl WalStore {
    /// Replay `wal_path` and start its writer. Must be called inside a Tokio runtime.
    pub fn open(organization_id: &str, wal_path: PathBuf, options: StoreOptions) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let shared = Shared {
            organization_id: organization_id.to_string(),
            classes: DashMap::new(),
            booking_to_class: DashMap::new(),
            member_classes: DashMap::new(),
            wal_tx,
            commit_timeout: options.commit_timeout,
        };
        let memberships = MembershipRegistry::new();
        let mut limits = OrganizationBookingLimits::default();

        for event in &replay.events {
            match event {
                Event::MembershipSet { membership } => memberships.put(membership.clone()),
                Event::LimitsConfigured {
                    max_classes_per_day,
                    timezone,
                } => match parse_timezone(timezone) {
                    Ok(tz) => {
                        limits = OrganizationBookingLimits {
                            max_classes_per_day: *max_classes_per_day,
                            timezone: tz,
                        }
                    }
                    Err(e) => tracing::warn!("replay: {e}"),
                },
                other => shared.replay_class_event(other),
            }
        }
        tracing::debug!(
            "store {organization_id}: replayed {} records, {} classes",
            replay.events.len(),
            shared.classes.len()
        );

        Ok(Self {
            shared: Arc::new(shared),
            memberships: Arc::new(memberships),
            limits: Arc::new(RwLock::new(limits)),
            admin: Arc::new(Mutex::new(())),
            lock_timeout: options.lock_timeout,
        })
    }

    pub fn organization_id(&self) -> &str {
        &self.shared.organization_id
    }

    pub fn memberships(&self) -> Arc<MembershipRegistry> {
        self.memberships.clone()
    }

    pub fn class_count(&self) -> usize {
        self.shared.classes.len()
    }

    pub async fn set_membership(&self, membership: Membership) -> Result<(), StorageError> {
        let admin = self.admin.clone().lock_owned().await;
        let event = Event::MembershipSet {
            membership: membership.clone(),
        };
        let memberships = self.memberships.clone();
        append_then_publish(self.shared.clone(), event, admin, move |_| async move {
            memberships.put(membership);
        })
        .await
    }

    pub async fn configure_limits(
        &self,
        max_classes_per_day: Option<u32>,
        timezone: &str,
    ) -> Result<(), StorageError> {
        let tz = parse_timezone(timezone).map_err(|_| StorageError::CheckViolation("unknown timezone"))?;
        let admin = self.admin.clone().lock_owned().await;
        let event = Event::LimitsConfigured {
            max_classes_per_day,
            timezone: tz.name().to_string(),
        };
        let limits = self.limits.clone();
        append_then_publish(self.shared.clone(), event, admin, move |_| async move {
            *limits.write().await = OrganizationBookingLimits {
                max_classes_per_day,
                timezone: tz,
            };
        })
        .await
    }

    /// Rewrite the WAL as the minimal set of records that recreates the current state.
    /// Holds every class lock (in id order) so no commit interleaves with the snapshot.
    pub async fn compact(&self) -> Result<(), StorageError> {
        let _admin = self.admin.lock().await;
        let mut ids: Vec<Ulid> = self.shared.classes.iter().map(|e| *e.key()).collect();
        ids.sort();

        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(lock) = self.shared.slot_lock(id) {
                guards.push(lock.lock_owned().await);
            }
        }

        let mut events = Vec::new();
        let limits = *self.limits.read().await;
        if limits != OrganizationBookingLimits::default() {
            events.push(Event::LimitsConfigured {
                max_classes_per_day: limits.max_classes_per_day,
                timezone: limits.timezone.name().to_string(),
            });
        }
        for membership in self.memberships.all() {
            events.push(Event::MembershipSet { membership });
        }
        for id in &ids {
            let Some(state) = self.shared.snapshot(id) else { continue };
            events.push(Event::ClassScheduled {
                class: state.class.clone(),
            });
            if !state.bookings.is_empty() {
                events.push(Event::ClassCommitted {
                    class_id: *id,
                    changes: state
                        .bookings
                        .iter()
                        .cloned()
                        .map(Change::BookingInserted)
                        .collect(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.shared
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StorageError::Io("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| StorageError::Io("WAL writer dropped response".into()))?
            .map_err(StorageError::from);
        drop(guards);
        result
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .shared
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn acquire(&self, class_id: Ulid) -> Result<Option<OwnedMutexGuard<()>>, StorageError> {
        let Some(lock) = self.shared.slot_lock(&class_id) else {
            return Ok(None);
        };
        match tokio::time::timeout(self.lock_timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(Some(guard)),
            Err(_) => Err(StorageError::Conflict(class_id)),
        }
    }
}

#[async_trait]
impl BookingRepository for WalStore {
    async fn lock_class(
        &self,
        organization_id: &str,
        class_id: Ulid,
    ) -> Result<Option<Box<dyn ClassTransaction>>, StorageError> {
        if organization_id != self.shared.organization_id {
            return Ok(None);
        }
        let Some(guard) = self.acquire(class_id).await? else {
            return Ok(None);
        };
        // Read after the lock is held so we see the latest commit.
        let Some(committed) = self.shared.snapshot(&class_id) else {
            return Ok(None);
        };
        Ok(Some(Box::new(WalTransaction {
            shared: self.shared.clone(),
            guard: Some(guard),
            working: (*committed).clone(),
            changes: Vec::new(),
        })))
    }

    fn class_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.shared.booking_to_class.get(booking_id).map(|e| *e.value())
    }

    async fn member_bookings_between(
        &self,
        organization_id: &str,
        member_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<BookedClass>, StorageError> {
        if organization_id != self.shared.organization_id {
            return Ok(Vec::new());
        }
        let class_ids: Vec<Ulid> = self
            .shared
            .member_classes
            .get(&member_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let mut out = Vec::new();
        for class_id in class_ids {
            let Some(state) = self.shared.snapshot(&class_id) else { continue };
            let start = state.class.start_time;
            if start < from || start >= to {
                continue;
            }
            out.extend(
                state
                    .bookings
                    .iter()
                    .filter(|b| b.member_id == member_id)
                    .map(|b| BookedClass {
                        booking_id: b.id,
                        class_id,
                        status: b.status,
                        class_start: start,
                    }),
            );
        }
        Ok(out)
    }

    fn class_snapshot(&self, class_id: &Ulid) -> Option<ClassState> {
        self.shared.snapshot(class_id).map(|s| (*s).clone())
    }

    fn ended_with_confirmed(&self, ended_before: Ms) -> Vec<Ulid> {
        let mut out = Vec::new();
        for entry in self.shared.classes.iter() {
            let state = &entry.value().committed;
            if state.class.end_time >= ended_before {
                continue;
            }
            out.extend(
                state
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Confirmed)
                    .map(|b| b.id),
            );
        }
        out
    }

    async fn insert_class(&self, class: ClassSession) -> Result<(), StorageError> {
        if class.organization_id != self.shared.organization_id {
            return Err(StorageError::CheckViolation("class belongs to another organization"));
        }
        let admin = self.admin.clone().lock_owned().await;
        if self.shared.classes.len() >= MAX_CLASSES_PER_TENANT {
            return Err(StorageError::LimitExceeded("too many classes"));
        }
        if self.shared.classes.contains_key(&class.id) {
            return Err(StorageError::AlreadyExists(class.id));
        }
        let event = Event::ClassScheduled { class };
        append_then_publish(self.shared.clone(), event.clone(), admin, move |shared| async move {
            shared.replay_class_event(&event);
        })
        .await
    }

    async fn mark_class_cancelled(&self, class_id: Ulid) -> Result<(), StorageError> {
        let guard = self
            .acquire(class_id)
            .await?
            .ok_or(StorageError::RowNotFound(class_id))?;
        let event = Event::ClassCancelled { id: class_id };
        append_then_publish(self.shared.clone(), event.clone(), guard, move |shared| async move {
            shared.replay_class_event(&event);
        })
        .await
    }
}

#[async_trait]
impl LimitsSource for WalStore {
    async fn booking_limits(&self, _organization_id: &str) -> Result<OrganizationBookingLimits, StorageError> {
        Ok(*self.limits.read().await)
    }
}

// ── Transaction ──────────────────────────────────────────

struct WalTransaction {
    shared: Arc<Shared>,
    /// Handed to the commit task, which releases it after publishing.
    guard: Option<OwnedMutexGuard<()>>,
    /// Private copy of the class; published only after the WAL write succeeds.
    working: ClassState,
    changes: Vec<Change>,
}

impl WalTransaction {
    fn stage(&mut self, change: Change) {
        self.working.apply(&change);
        self.changes.push(change);
    }
}

#[async_trait]
impl ClassTransaction for WalTransaction {
    fn class(&self) -> &ClassSession {
        &self.working.class
    }

    fn booking(&self, booking_id: &Ulid) -> Option<&Booking> {
        self.working.booking(booking_id)
    }

    fn active_booking_for(&self, member_id: &Ulid) -> Option<&Booking> {
        self.working.active_booking_for(member_id)
    }

    fn waitlist_ordered(&self) -> Vec<&Booking> {
        self.working.waitlist_ordered()
    }

    fn insert_booking(&mut self, booking: Booking) -> Result<(), StorageError> {
        if booking.class_id != self.working.class.id {
            return Err(StorageError::CheckViolation("booking class does not match locked class"));
        }
        if self.working.bookings.len() >= MAX_BOOKINGS_PER_CLASS {
            return Err(StorageError::LimitExceeded("too many bookings on class"));
        }
        if booking.is_active() && self.working.active_booking_for(&booking.member_id).is_some() {
            return Err(StorageError::UniqueViolation {
                class_id: booking.class_id,
                member_id: booking.member_id,
            });
        }
        if (booking.status == BookingStatus::Waitlist) != booking.waitlist_position.is_some() {
            return Err(StorageError::CheckViolation("waitlist_position present iff status = waitlist"));
        }
        self.stage(Change::BookingInserted(booking));
        Ok(())
    }

    fn update_booking_status(&mut self, update: StatusUpdate) -> Result<(), StorageError> {
        if self.working.booking(&update.booking_id).is_none() {
            return Err(StorageError::RowNotFound(update.booking_id));
        }
        if (update.status == BookingStatus::Waitlist) != update.waitlist_position.is_some() {
            return Err(StorageError::CheckViolation("waitlist_position present iff status = waitlist"));
        }
        self.stage(Change::BookingStatusChanged(update));
        Ok(())
    }

    fn update_confirmed_count(&mut self, count: u32) -> Result<(), StorageError> {
        if count > self.working.class.capacity {
            return Err(StorageError::CheckViolation("confirmed_count exceeds capacity"));
        }
        self.stage(Change::ConfirmedCountSet(count));
        Ok(())
    }

    fn bulk_update_waitlist_positions(&mut self, positions: Vec<(Ulid, u32)>) -> Result<(), StorageError> {
        if positions.is_empty() {
            return Ok(());
        }
        for (id, pos) in &positions {
            match self.working.booking(id) {
                Some(b) if b.status == BookingStatus::Waitlist && *pos >= 1 => {}
                Some(_) => return Err(StorageError::CheckViolation("renumbering a booking that is not waitlisted")),
                None => return Err(StorageError::RowNotFound(*id)),
            }
        }
        self.stage(Change::WaitlistRenumbered(positions));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        if self.changes.is_empty() {
            return Ok(());
        }
        let guard = self
            .guard
            .take()
            .ok_or(StorageError::CheckViolation("transaction already committed"))?;
        let class_id = self.working.class.id;
        let changes = std::mem::take(&mut self.changes);
        let event = Event::ClassCommitted {
            class_id,
            changes: changes.clone(),
        };
        let working = Arc::new(self.working.clone());

        append_then_publish(self.shared.clone(), event, guard, move |shared| async move {
            for change in &changes {
                if let Change::BookingInserted(b) = change {
                    shared.index_booking(b);
                }
            }
            if let Some(mut slot) = shared.classes.get_mut(&class_id) {
                slot.committed = working;
            }
        })
        .await
    }
}
