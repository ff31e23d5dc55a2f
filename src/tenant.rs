use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::{ClockSource, SystemClock};
use crate::engine::Engine;
use crate::limits::*;
use crate::model::Ms;
use crate::notify::NotifyHub;
use crate::store::{StoreOptions, WalStore};
use crate::sweeper;

/// One organization: its store, WAL and engine.
pub struct Tenant {
    pub organization_id: String,
    pub store: Arc<WalStore>,
    pub engine: Arc<Engine>,
}

/// Manages per-organization engines. Each gets its own store + WAL + background tasks.
/// Organization = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    store_options: StoreOptions,
    no_show_grace: Option<Ms>,
    clock: Arc<dyn ClockSource>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            compact_threshold,
            store_options: StoreOptions::default(),
            no_show_grace: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_store_options(mut self, options: StoreOptions) -> Self {
        self.store_options = options;
        self
    }

    /// Enable the no-show sweeper for every organization.
    pub fn with_no_show_grace(mut self, grace: Option<Ms>) -> Self {
        self.no_show_grace = grace;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// Get or lazily open the organization named `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Tenant>> {
        if let Some(t) = self.tenants.get(tenant) {
            return Ok(t.value().clone());
        }
        validate_name(tenant)?;
        if self.tenants.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The entry guard keeps a concurrent first connection from opening the same WAL twice.
        match self.tenants.entry(tenant.to_string()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let t = Arc::new(self.open(tenant)?);
                slot.insert(t.clone());
                metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
                Ok(t)
            }
        }
    }

    fn open(&self, organization_id: &str) -> io::Result<Tenant> {
        let wal_path = self.data_dir.join(format!("{organization_id}.wal"));
        let store = Arc::new(WalStore::open(organization_id, wal_path, self.store_options)?);
        let engine = Arc::new(Engine::over_store(
            store.clone(),
            self.clock.clone(),
            Arc::new(NotifyHub::new()),
        ));

        tokio::spawn(sweeper::run_compactor(store.clone(), self.compact_threshold));
        if let Some(grace) = self.no_show_grace {
            tokio::spawn(sweeper::run_no_show_sweeper(
                engine.clone(),
                organization_id.to_string(),
                grace,
            ));
        }
        tracing::info!("opened organization {organization_id} ({} classes)", store.class_count());

        Ok(Tenant {
            organization_id: organization_id.to_string(),
            store,
            engine,
        })
    }
}

/// Names map 1:1 to WAL file names, so anything that could escape the data dir or
/// collide after sanitizing is rejected outright.
fn validate_name(tenant: &str) -> io::Result<()> {
    if tenant.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    if !tenant.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tenant name may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::daily_limit::LimitsSource;
    use crate::engine::AdmissionError;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    const T0: Ms = 1_709_251_200_000;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("turnstile_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000).with_clock(Arc::new(ManualClock::new(T0)))
    }

    fn class(org: &str, id: Ulid) -> ClassSession {
        ClassSession {
            id,
            organization_id: org.into(),
            name: None,
            start_time: T0 + 24 * HOUR_MS,
            end_time: T0 + 25 * HOUR_MS,
            capacity: 1,
            waitlist_enabled: false,
            waitlist_capacity: 0,
            booking_opens_hours: None,
            booking_closes_minutes: 0,
            cancellation_deadline_hours: 0,
            is_cancelled: false,
            confirmed_count: 0,
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let a = tm.get_or_create("gym_a").unwrap();
        let b = tm.get_or_create("gym_b").unwrap();

        let class_id = Ulid::new();
        a.engine.schedule_class(class("gym_a", class_id)).await.unwrap();

        assert!(a.engine.get_class("gym_a", class_id).is_some());
        assert!(b.engine.get_class("gym_b", class_id).is_none());
        // Same id, other organization: independent.
        b.engine.schedule_class(class("gym_b", class_id)).await.unwrap();

        // Another organization's id cannot reach into this store.
        let err = a
            .engine
            .reserve("gym_b", class_id, Ulid::new(), Actor::Staff)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::ClassUnavailable(class_id));
    }

    #[tokio::test]
    async fn tenant_lazy_creation_reuses_instance() {
        let tm = manager(test_data_dir("lazy"));
        assert!(tm.is_empty());
        let first = tm.get_or_create("gym").unwrap();
        let second = tm.get_or_create("gym").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tm.len(), 1);
        assert_eq!(first.organization_id, "gym");
    }

    #[tokio::test]
    async fn tenant_rejects_bad_names() {
        let tm = manager(test_data_dir("names"));
        assert!(tm.get_or_create("").is_err());
        assert!(tm.get_or_create("../etc").is_err());
        assert!(tm.get_or_create("gym.a").is_err());
        assert!(tm.get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1)).is_err());
        assert!(tm.is_empty());
    }

    #[tokio::test]
    async fn tenant_state_survives_reopen() {
        let dir = test_data_dir("reopen");
        let class_id = Ulid::new();
        {
            let tm = manager(dir.clone());
            let t = tm.get_or_create("gym").unwrap();
            t.engine.schedule_class(class("gym", class_id)).await.unwrap();
            t.store.configure_limits(Some(3), "Europe/Madrid").await.unwrap();
        }
        let tm = manager(dir);
        let t = tm.get_or_create("gym").unwrap();
        assert_eq!(t.engine.get_class("gym", class_id).unwrap().capacity, 1);
        let limits = t.store.booking_limits("gym").await.unwrap();
        assert_eq!(limits.max_classes_per_day, Some(3));
        assert_eq!(limits.timezone, chrono_tz::Tz::Europe__Madrid);
    }
}
