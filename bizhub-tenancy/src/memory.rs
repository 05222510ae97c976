//! In-memory collaborators
//!
//! [`InMemoryMasterStore`] and [`InMemoryDatabaseEngine`] implement the
//! store and engine traits without any external service. They count calls
//! and accept injected failures, which makes them suitable both for tests
//! and for local development.

use crate::code::TenantCode;
use crate::connection_string::ConnectionString;
use crate::database::{BackupRequest, CreateDatabaseSpec, DatabaseEngine, SeedPlan, TenantConnection};
use crate::error::{TenantError, TenantResult};
use crate::store::{MasterTransaction, SubscriptionStore, TenantStore, TenantUserStore};
use crate::tenant::{ModuleSubscription, Tenant, TenantId, TenantStatus, TenantUser};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct MasterState {
    tenants: BTreeMap<TenantId, Tenant>,
    users: Vec<TenantUser>,
    subscriptions: BTreeMap<i64, ModuleSubscription>,
}

#[derive(Debug, Default)]
struct MasterInner {
    state: RwLock<MasterState>,
    get_by_id_calls: AtomicUsize,
    get_by_code_calls: AtomicUsize,
    active_tenant_calls: AtomicUsize,
    user_calls: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_next_commit: AtomicBool,
}

/// In-memory master catalog
#[derive(Debug, Clone, Default)]
pub struct InMemoryMasterStore {
    inner: Arc<MasterInner>,
}

impl InMemoryMasterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a tenant directly, bypassing transactions.
    pub fn insert_tenant(&self, tenant: Tenant) {
        self.inner.state.write().tenants.insert(tenant.id(), tenant);
    }

    pub fn add_user(&self, user: TenantUser) {
        self.inner.state.write().users.push(user);
    }

    pub fn add_subscription(&self, subscription: ModuleSubscription) {
        self.inner
            .state
            .write()
            .subscriptions
            .insert(subscription.id, subscription);
    }

    /// Committed state of a tenant; not counted as a lookup.
    pub fn tenant(&self, id: TenantId) -> Option<Tenant> {
        self.inner.state.read().tenants.get(&id).cloned()
    }

    pub fn subscriptions(&self, tenant_id: TenantId) -> Vec<ModuleSubscription> {
        self.inner
            .state
            .read()
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn get_by_id_calls(&self) -> usize {
        self.inner.get_by_id_calls.load(Ordering::SeqCst)
    }

    pub fn get_by_code_calls(&self) -> usize {
        self.inner.get_by_code_calls.load(Ordering::SeqCst)
    }

    pub fn active_tenant_calls(&self) -> usize {
        self.inner.active_tenant_calls.load(Ordering::SeqCst)
    }

    pub fn user_calls(&self) -> usize {
        self.inner.user_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    /// Make the next commit fail with a transient error.
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TenantStore for InMemoryMasterStore {
    async fn get_by_id(&self, id: TenantId) -> TenantResult<Option<Tenant>> {
        self.inner.get_by_id_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.inner.state.read().tenants.get(&id).cloned())
    }

    async fn get_by_code(&self, code: &TenantCode) -> TenantResult<Option<Tenant>> {
        self.inner.get_by_code_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inner
            .state
            .read()
            .tenants
            .values()
            .find(|t| t.code() == code)
            .cloned())
    }

    async fn get_active_tenants(&self) -> TenantResult<Vec<Tenant>> {
        self.inner.active_tenant_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inner
            .state
            .read()
            .tenants
            .values()
            .filter(|t| t.status() == TenantStatus::Active)
            .cloned()
            .collect())
    }

    async fn begin(&self) -> TenantResult<Box<dyn MasterTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            tenants: BTreeMap::new(),
            inserted: HashSet::new(),
            subscriptions: BTreeMap::new(),
        }))
    }
}

#[async_trait]
impl TenantUserStore for InMemoryMasterStore {
    async fn get_by_email(&self, email: &str, tenant_id: TenantId) -> TenantResult<Option<TenantUser>> {
        self.inner.user_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inner
            .state
            .read()
            .users
            .iter()
            .find(|u| u.tenant_id == tenant_id && u.email_matches(email))
            .cloned())
    }

    async fn get_by_tenant(&self, tenant_id: TenantId) -> TenantResult<Vec<TenantUser>> {
        self.inner.user_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inner
            .state
            .read()
            .users
            .iter()
            .filter(|u| u.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryMasterStore {
    async fn get_subscriptions(&self, tenant_id: TenantId) -> TenantResult<Vec<ModuleSubscription>> {
        Ok(self.subscriptions(tenant_id))
    }
}

struct InMemoryTransaction {
    inner: Arc<MasterInner>,
    tenants: BTreeMap<TenantId, Tenant>,
    inserted: HashSet<TenantId>,
    subscriptions: BTreeMap<i64, ModuleSubscription>,
}

impl InMemoryTransaction {
    fn validate(&self, state: &MasterState) -> TenantResult<()> {
        let mut merged = state.tenants.clone();
        for (id, tenant) in &self.tenants {
            if self.inserted.contains(id) && state.tenants.contains_key(id) {
                return Err(TenantError::PreconditionFailed(format!(
                    "tenant {id} already exists"
                )));
            }
            merged.insert(*id, tenant.clone());
        }

        let mut codes = HashSet::new();
        let mut databases = HashSet::new();
        for tenant in merged.values() {
            if !codes.insert(tenant.code().as_str().to_string()) {
                return Err(TenantError::PreconditionFailed(format!(
                    "tenant code {} is already in use",
                    tenant.code()
                )));
            }
            if let Some(info) = tenant.database_info() {
                if !databases.insert(info.database_name().to_ascii_lowercase()) {
                    return Err(TenantError::PreconditionFailed(format!(
                        "database {} is already assigned",
                        info.database_name()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MasterTransaction for InMemoryTransaction {
    async fn get_tenant(&mut self, id: TenantId) -> TenantResult<Option<Tenant>> {
        if let Some(staged) = self.tenants.get(&id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.inner.state.read().tenants.get(&id).cloned())
    }

    async fn get_tenant_by_code(&mut self, code: &TenantCode) -> TenantResult<Option<Tenant>> {
        if let Some(staged) = self.tenants.values().find(|t| t.code() == code) {
            return Ok(Some(staged.clone()));
        }
        Ok(self
            .inner
            .state
            .read()
            .tenants
            .values()
            .find(|t| t.code() == code && !self.tenants.contains_key(&t.id()))
            .cloned())
    }

    async fn next_tenant_id(&mut self) -> TenantResult<TenantId> {
        let committed = self.inner.state.read().tenants.keys().next_back().copied();
        let staged = self.tenants.keys().next_back().copied();
        Ok(committed.max(staged).unwrap_or(0) + 1)
    }

    async fn insert_tenant(&mut self, tenant: &Tenant) -> TenantResult<()> {
        if self.tenants.contains_key(&tenant.id()) || self.inner.state.read().tenants.contains_key(&tenant.id()) {
            return Err(TenantError::PreconditionFailed(format!(
                "tenant {} already exists",
                tenant.id()
            )));
        }
        self.inserted.insert(tenant.id());
        self.tenants.insert(tenant.id(), tenant.clone());
        Ok(())
    }

    async fn update_tenant(&mut self, tenant: &Tenant) -> TenantResult<()> {
        let known = self.tenants.contains_key(&tenant.id())
            || self.inner.state.read().tenants.contains_key(&tenant.id());
        if !known {
            return Err(TenantError::NotFound(tenant.id().to_string()));
        }
        self.tenants.insert(tenant.id(), tenant.clone());
        Ok(())
    }

    async fn active_subscriptions(&mut self, tenant_id: TenantId) -> TenantResult<Vec<ModuleSubscription>> {
        let state = self.inner.state.read();
        Ok(state
            .subscriptions
            .values()
            .map(|s| self.subscriptions.get(&s.id).unwrap_or(s))
            .filter(|s| s.tenant_id == tenant_id && s.is_active())
            .cloned()
            .collect())
    }

    async fn update_subscription(&mut self, subscription: &ModuleSubscription) -> TenantResult<()> {
        if !self.inner.state.read().subscriptions.contains_key(&subscription.id) {
            return Err(TenantError::NotFound(format!("subscription {}", subscription.id)));
        }
        self.subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> TenantResult<()> {
        if self.inner.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Err(TenantError::transient("commit failed: deadlock victim"));
        }

        let inner = Arc::clone(&self.inner);
        let mut state = inner.state.write();
        self.validate(&state)?;
        let this = *self;
        state.tenants.extend(this.tenants);
        state.subscriptions.extend(this.subscriptions);
        inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> TenantResult<()> {
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine call, used to inject failures and inspect the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOperation {
    DatabaseExists,
    CreateDatabase,
    DropDatabase,
    CreateLogin,
    DropLogin,
    SetSingleUser,
    SetMultiUser,
    Backup,
    Restore,
    Connect,
    PendingMigrations,
    ApplyMigrations,
    Seed,
    IsOnline,
    BaseTableCount,
    RoundTrip,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    error: TenantError,
    once: bool,
}

#[derive(Debug, Clone)]
struct DatabaseState {
    spec: CreateDatabaseSpec,
    single_user: bool,
    applied: Vec<String>,
    seeded: Option<SeedPlan>,
    base_tables: u64,
}

impl DatabaseState {
    fn new(spec: CreateDatabaseSpec) -> Self {
        Self {
            spec,
            single_user: false,
            applied: Vec::new(),
            seeded: None,
            base_tables: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct LoginState {
    password: String,
    database: String,
}

#[derive(Debug)]
struct EngineState {
    databases: HashMap<String, DatabaseState>,
    logins: HashMap<String, LoginState>,
    backups: HashMap<PathBuf, DatabaseState>,
    failures: HashMap<EngineOperation, InjectedFailure>,
    calls: Vec<EngineOperation>,
    migrations: Vec<String>,
    healthy: bool,
    write_backup_files: bool,
    last_connection_string: Option<ConnectionString>,
}

impl EngineState {
    fn record(&mut self, op: EngineOperation) -> TenantResult<()> {
        self.calls.push(op);
        match self.failures.get(&op).cloned() {
            Some(failure) => {
                if failure.once {
                    self.failures.remove(&op);
                }
                Err(failure.error)
            }
            None => Ok(()),
        }
    }

    fn database_mut(&mut self, name: &str) -> TenantResult<&mut DatabaseState> {
        self.databases
            .get_mut(name)
            .ok_or_else(|| TenantError::NotFound(format!("database {name}")))
    }
}

/// Simulated relational engine
///
/// A new database has no base tables until migrations are applied.
/// Backups are written to disk as small marker files unless
/// [`InMemoryDatabaseEngine::suppress_backup_files`] is set.
#[derive(Debug, Clone)]
pub struct InMemoryDatabaseEngine {
    state: Arc<Mutex<EngineState>>,
}

impl Default for InMemoryDatabaseEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatabaseEngine {
    /// Engine with a two-migration catalog.
    pub fn new() -> Self {
        Self::with_migrations(vec![
            "20240101_Initial".to_string(),
            "20240215_Inventory".to_string(),
        ])
    }

    pub fn with_migrations(migrations: Vec<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                databases: HashMap::new(),
                logins: HashMap::new(),
                backups: HashMap::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
                migrations,
                healthy: true,
                write_backup_files: true,
                last_connection_string: None,
            })),
        }
    }

    /// Fail every call of `op` until cleared.
    pub fn fail_on(&self, op: EngineOperation, error: TenantError) {
        self.state
            .lock()
            .failures
            .insert(op, InjectedFailure { error, once: false });
    }

    /// Fail the next call of `op` only.
    pub fn fail_once(&self, op: EngineOperation, error: TenantError) {
        self.state
            .lock()
            .failures
            .insert(op, InjectedFailure { error, once: true });
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// When false, online and round-trip checks report failure.
    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    /// Report backups as complete without writing the file.
    pub fn suppress_backup_files(&self, suppress: bool) {
        self.state.lock().write_backup_files = !suppress;
    }

    /// Publish a new migration; existing databases see it as pending.
    pub fn add_migration(&self, id: impl Into<String>) {
        self.state.lock().migrations.push(id.into());
    }

    /// Create a database out of band.
    pub fn add_database(&self, name: &str) {
        let spec = CreateDatabaseSpec {
            name: name.to_string(),
            collation: "SQL_Latin1_General_CP1_CI_AS".to_string(),
            recovery_model: Default::default(),
            compatibility_level: 150,
            data_path: None,
            log_path: None,
        };
        self.state
            .lock()
            .databases
            .insert(name.to_string(), DatabaseState::new(spec));
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().databases.contains_key(name)
    }

    pub fn has_login(&self, login: &str) -> bool {
        self.state.lock().logins.contains_key(login)
    }

    pub fn database_count(&self) -> usize {
        self.state.lock().databases.len()
    }

    pub fn is_single_user(&self, name: &str) -> bool {
        self.state
            .lock()
            .databases
            .get(name)
            .is_some_and(|db| db.single_user)
    }

    pub fn database_spec(&self, name: &str) -> Option<CreateDatabaseSpec> {
        self.state.lock().databases.get(name).map(|db| db.spec.clone())
    }

    pub fn applied_migrations(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .databases
            .get(name)
            .map(|db| db.applied.clone())
            .unwrap_or_default()
    }

    pub fn seed_plan(&self, name: &str) -> Option<SeedPlan> {
        self.state
            .lock()
            .databases
            .get(name)
            .and_then(|db| db.seeded.clone())
    }

    pub fn calls(&self) -> Vec<EngineOperation> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, op: EngineOperation) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Connection string of the most recent `connect`.
    pub fn last_connection_string(&self) -> Option<ConnectionString> {
        self.state.lock().last_connection_string.clone()
    }
}

#[async_trait]
impl DatabaseEngine for InMemoryDatabaseEngine {
    async fn database_exists(&self, name: &str) -> TenantResult<bool> {
        let mut state = self.state.lock();
        state.record(EngineOperation::DatabaseExists)?;
        Ok(state.databases.contains_key(name))
    }

    async fn create_database(&self, spec: &CreateDatabaseSpec) -> TenantResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOperation::CreateDatabase)?;
        if state.databases.contains_key(&spec.name) {
            return Err(TenantError::infrastructure(format!(
                "database '{}' already exists",
                spec.name
            )));
        }
        state
            .databases
            .insert(spec.name.clone(), DatabaseState::new(spec.clone()));
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> TenantResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOperation::DropDatabase)?;
        state
            .databases
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TenantError::NotFound(format!("database {name}")))
    }

    async fn create_login(&self, login: &str, password: &str, database: &str) -> TenantResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOperation::CreateLogin)?;
        if !state.databases.contains_key(database) {
            return Err(TenantError::NotFound(format!("database {database}")));
        }
        if state.logins.contains_key(login) {
            return Err(TenantError::infrastructure(format!("login '{login}' already exists")));
        }
        state.logins.insert(
            login.to_string(),
            LoginState {
                password: password.to_string(),
                database: database.to_string(),
            },
        );
        Ok(())
    }

    async fn drop_login(&self, login: &str) -> TenantResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOperation::DropLogin)?;
        state
            .logins
            .remove(login)
            .map(|_| ())
            .ok_or_else(|| TenantError::NotFound(format!("login {login}")))
    }

    async fn set_single_user(&self, database: &str) -> TenantResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOperation::SetSingleUser)?;
        state.database_mut(database)?.single_user = true;
        Ok(())
    }

    async fn set_multi_user(&self, database: &str) -> TenantResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOperation::SetMultiUser)?;
        state.database_mut(database)?.single_user = false;
        Ok(())
    }

    async fn backup_database(&self, request: &BackupRequest) -> TenantResult<()> {
        let (write, contents) = {
            let mut state = self.state.lock();
            state.record(EngineOperation::Backup)?;
            let snapshot = state
                .databases
                .get(&request.database)
                .cloned()
                .ok_or_else(|| TenantError::NotFound(format!("database {}", request.database)))?;
            let contents = format!(
                "BIZHUB-BACKUP\ndatabase={}\nlabel={}\nmigrations={}\n",
                request.database,
                request.label,
                snapshot.applied.join(",")
            );
            state.backups.insert(request.path.clone(), snapshot);
            (state.write_backup_files, contents)
        };

        if write {
            tokio::fs::write(&request.path, contents)
                .await
                .map_err(|e| TenantError::infrastructure(format!("backup write failed: {e}")))?;
        }
        Ok(())
    }

    async fn restore_database(&self, database: &str, path: &Path) -> TenantResult<()> {
        self.state.lock().record(EngineOperation::Restore)?;

        let on_disk = tokio::fs::try_exists(path).await.unwrap_or(false);
        let mut state = self.state.lock();
        let snapshot = state.backups.get(path).cloned();
        match (snapshot, on_disk) {
            (Some(mut snapshot), _) => {
                snapshot.spec.name = database.to_string();
                snapshot.single_user = state
                    .databases
                    .get(database)
                    .is_some_and(|db| db.single_user);
                state.databases.insert(database.to_string(), snapshot);
                Ok(())
            }
            (None, true) if state.databases.contains_key(database) => Ok(()),
            _ => Err(TenantError::NotFound(format!(
                "backup set {}",
                path.display()
            ))),
        }
    }

    async fn connect(&self, connection_string: &ConnectionString) -> TenantResult<Box<dyn TenantConnection>> {
        let mut state = self.state.lock();
        state.record(EngineOperation::Connect)?;
        state.last_connection_string = Some(connection_string.clone());

        let database = connection_string
            .database()
            .ok_or_else(|| TenantError::Validation("connection string has no database".to_string()))?
            .to_string();
        if !state.databases.contains_key(&database) {
            return Err(TenantError::infrastructure(format!(
                "cannot open database '{database}'"
            )));
        }
        if let Some(user) = connection_string.user_id() {
            let authorised = state.logins.get(user).is_some_and(|login| {
                login.database == database && Some(login.password.as_str()) == connection_string.get("Password")
            });
            if !authorised {
                return Err(TenantError::infrastructure(format!("login failed for user '{user}'")));
            }
        }

        Ok(Box::new(InMemoryConnection {
            state: Arc::clone(&self.state),
            database,
        }))
    }
}

struct InMemoryConnection {
    state: Arc<Mutex<EngineState>>,
    database: String,
}

#[async_trait]
impl TenantConnection for InMemoryConnection {
    async fn pending_migrations(&mut self) -> TenantResult<Vec<String>> {
        let mut state = self.state.lock();
        state.record(EngineOperation::PendingMigrations)?;
        let catalog = state.migrations.clone();
        let db = state.database_mut(&self.database)?;
        Ok(catalog
            .into_iter()
            .filter(|m| !db.applied.contains(m))
            .collect())
    }

    async fn apply_migrations(&mut self, migrations: &[String]) -> TenantResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOperation::ApplyMigrations)?;
        let db = state.database_mut(&self.database)?;
        for migration in migrations {
            if !db.applied.contains(migration) {
                db.applied.push(migration.clone());
                db.base_tables += 4;
            }
        }
        Ok(())
    }

    async fn seed(&mut self, plan: &SeedPlan) -> TenantResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOperation::Seed)?;
        let db = state.database_mut(&self.database)?;
        if db.base_tables == 0 {
            return Err(TenantError::infrastructure("cannot seed an unmigrated database"));
        }
        db.seeded = Some(plan.clone());
        Ok(())
    }

    async fn is_online(&mut self) -> TenantResult<bool> {
        let mut state = self.state.lock();
        state.record(EngineOperation::IsOnline)?;
        let healthy = state.healthy;
        let db = state.database_mut(&self.database)?;
        Ok(healthy && !db.single_user)
    }

    async fn base_table_count(&mut self) -> TenantResult<u64> {
        let mut state = self.state.lock();
        state.record(EngineOperation::BaseTableCount)?;
        Ok(state.database_mut(&self.database)?.base_tables)
    }

    async fn round_trip(&mut self, probe: &str) -> TenantResult<bool> {
        let mut state = self.state.lock();
        state.record(EngineOperation::RoundTrip)?;
        let healthy = state.healthy;
        state.database_mut(&self.database)?;
        Ok(healthy && !probe.is_empty())
    }
}
