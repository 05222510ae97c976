//! Tenant database lifecycle
//!
//! [`TenantDatabaseService`] creates, migrates, seeds, backs up, restores,
//! health-checks and deletes the physical database of a tenant. Each
//! operation is a fixed sequence of engine and master-catalog steps.
//!
//! Failure reporting follows one rule: if nothing was changed yet, the
//! original error is returned as is; once a side effect happened, the error
//! is wrapped in [`TenantError::ProvisioningFailed`] together with the step
//! that failed and the outcome of the compensating action.
//!
//! Cancellation is checked at every round trip. A cancelled operation
//! returns [`TenantError::Cancelled`] and leaves whatever the last completed
//! step produced; no compensation runs.

use crate::clock::{Clock, SystemClock, strictly_after};
use crate::code::TenantCode;
use crate::config::TenancyConfig;
use crate::connection_string::ConnectionString;
use crate::crypto::{SecretProvider, generate_password};
use crate::database::{
    BackupRequest, CreateDatabaseSpec, DatabaseEngine, SeedPlan, TenantConnection, database_name,
    login_name,
};
use crate::database_info::DatabaseInfo;
use crate::error::{CompensationOutcome, ProvisioningStep, TenantError, TenantResult};
use crate::resilience::ResilientExecutor;
use crate::resolver::TenantResolver;
use crate::settings::TenantSettings;
use crate::store::{MasterTransaction, TenantStore};
use crate::tenant::{AuditStamp, Tenant, TenantId, TenantStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Cancellation reason recorded on subscriptions of a deleted database.
pub const DELETION_REASON: &str = "Database deletion";

/// Outcome of [`TenantDatabaseService::delete_tenant_database`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub tenant_id: TenantId,
    pub database: String,
    /// Safety backup taken before the drop, if it succeeded
    pub backup_path: Option<PathBuf>,
    /// `FailedButContinuing` when the deletion went ahead without a backup
    pub safety_backup: CompensationOutcome,
    pub cancelled_subscriptions: usize,
}

/// Side effects performed so far by a create, for compensation.
#[derive(Debug, Default)]
struct CreateProgress {
    step: Option<ProvisioningStep>,
    database: Option<String>,
    login: Option<String>,
}

/// Side effects performed so far by a delete.
#[derive(Debug, Default)]
struct DeleteProgress {
    step: Option<ProvisioningStep>,
    single_user: Option<String>,
    dropped: bool,
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = TenantResult<T>>,
) -> TenantResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TenantError::Cancelled),
        result = fut => result,
    }
}

/// Physical database lifecycle of tenants
pub struct TenantDatabaseService {
    store: Arc<dyn TenantStore>,
    engine: Arc<dyn DatabaseEngine>,
    secrets: Arc<dyn SecretProvider>,
    resolver: Arc<TenantResolver>,
    config: TenancyConfig,
    clock: Arc<dyn Clock>,
    executor: ResilientExecutor,
    locks: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TenantDatabaseService {
    pub fn new(
        store: Arc<dyn TenantStore>,
        engine: Arc<dyn DatabaseEngine>,
        secrets: Arc<dyn SecretProvider>,
        resolver: Arc<TenantResolver>,
        config: TenancyConfig,
    ) -> Self {
        Self {
            store,
            engine,
            secrets,
            resolver,
            config,
            clock: Arc::new(SystemClock),
            executor: ResilientExecutor::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Retry and circuit-breaker policy for engine calls.
    pub fn with_executor(mut self, executor: ResilientExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }

    pub fn executor(&self) -> &ResilientExecutor {
        &self.executor
    }

    fn stamp(&self) -> AuditStamp {
        AuditStamp::system(self.clock.now())
    }

    async fn engine_call<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> TenantResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TenantResult<T>>,
    {
        cancellable(cancel, self.executor.execute(op)).await
    }

    async fn lock_tenant(
        &self,
        id: TenantId,
        cancel: &CancellationToken,
    ) -> TenantResult<tokio::sync::OwnedMutexGuard<()>> {
        let lock = Arc::clone(self.locks.lock().entry(id).or_default());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TenantError::Cancelled),
            guard = lock.lock_owned() => Ok(guard),
        }
    }

    async fn rollback(&self, tx: Box<dyn MasterTransaction>, tenant_id: TenantId) {
        if let Err(e) = tx.rollback().await {
            error!(tenant_id, error = %e, "Master transaction rollback failed");
        }
    }

    async fn best_effort(
        &self,
        tenant_id: TenantId,
        action: &str,
        fut: impl Future<Output = TenantResult<()>>,
    ) -> CompensationOutcome {
        match fut.await {
            Ok(()) => {
                info!(tenant_id, action, "Compensating action completed");
                CompensationOutcome::Succeeded
            }
            Err(e) => {
                error!(tenant_id, action, error = %e, "Compensating action failed, continuing");
                CompensationOutcome::FailedButContinuing(format!("{action}: {e}"))
            }
        }
    }

    async fn load_tenant(&self, id: TenantId, cancel: &CancellationToken) -> TenantResult<Tenant> {
        cancellable(cancel, self.store.get_by_id(id))
            .await?
            .ok_or_else(|| TenantError::NotFound(id.to_string()))
    }

    /// Connection string of `info`, with the server certificate trusted.
    fn open_connection_string(&self, info: &DatabaseInfo) -> TenantResult<ConnectionString> {
        let base = match info.encrypted_connection_string() {
            Some(encrypted) => {
                let plain = Zeroizing::new(self.secrets.decrypt(encrypted)?);
                ConnectionString::parse(&plain)?
            }
            None if info.uses_integrated_security() => ConnectionString::new()
                .with_server(info.server(), info.port())
                .with_database(info.database_name())
                .set("Integrated Security", "True"),
            None => {
                return Err(TenantError::PreconditionFailed(format!(
                    "database {} has no connection string",
                    info.database_name()
                )));
            }
        };
        Ok(base.with_trust_server_certificate(true))
    }

    async fn connect(
        &self,
        info: &DatabaseInfo,
        cancel: &CancellationToken,
    ) -> TenantResult<Box<dyn TenantConnection>> {
        let cs = self.open_connection_string(info)?;
        debug!(database = info.database_name(), connection = %cs.redacted(), "Connecting to tenant database");
        self.engine_call(cancel, || self.engine.connect(&cs)).await
    }

    /// Load, mutate and commit a tenant in its own transaction.
    async fn update_tenant<F>(
        &self,
        id: TenantId,
        cancel: &CancellationToken,
        update: F,
    ) -> TenantResult<Tenant>
    where
        F: FnOnce(&mut Tenant, &AuditStamp) -> TenantResult<()>,
    {
        let mut tx = cancellable(cancel, self.store.begin()).await?;
        let stamp = self.stamp();
        match Self::stage_update(tx.as_mut(), id, &stamp, update, cancel).await {
            Ok(tenant) => {
                cancellable(cancel, tx.commit()).await?;
                self.resolver.evict(id);
                Ok(tenant)
            }
            Err(TenantError::Cancelled) => Err(TenantError::Cancelled),
            Err(e) => {
                self.rollback(tx, id).await;
                Err(e)
            }
        }
    }

    async fn stage_update<F>(
        tx: &mut dyn MasterTransaction,
        id: TenantId,
        stamp: &AuditStamp,
        update: F,
        cancel: &CancellationToken,
    ) -> TenantResult<Tenant>
    where
        F: FnOnce(&mut Tenant, &AuditStamp) -> TenantResult<()>,
    {
        let mut tenant = cancellable(cancel, tx.get_tenant(id))
            .await?
            .ok_or_else(|| TenantError::NotFound(id.to_string()))?;
        update(&mut tenant, stamp)?;
        cancellable(cancel, tx.update_tenant(&tenant)).await?;
        Ok(tenant)
    }

    // ========== Create ==========

    /// Create the physical database of a `Pending` tenant.
    ///
    /// Creates the database and a login restricted to it, stores the
    /// encrypted credentials on the tenant, gives it default settings if it
    /// has none, activates it and commits. Returns the plain connection
    /// string.
    ///
    /// On a failure after the database was created, the master transaction
    /// is rolled back and the login and database created by this call are
    /// dropped best-effort.
    pub async fn create_tenant_database(
        &self,
        tenant_id: TenantId,
        tenant_code: &str,
        cancel: &CancellationToken,
    ) -> TenantResult<String> {
        let _guard = self.lock_tenant(tenant_id, cancel).await?;
        info!(tenant_id, tenant_code, "Creating tenant database");

        let mut tx = cancellable(cancel, self.store.begin()).await?;
        let mut progress = CreateProgress::default();

        let staged = self
            .create_steps(tx.as_mut(), tenant_id, tenant_code, cancel, &mut progress)
            .await;
        let (tenant, connection_string) = match staged {
            Ok(staged) => staged,
            Err(TenantError::Cancelled) => {
                warn!(tenant_id, step = ?progress.step, "Tenant database creation cancelled");
                return Err(TenantError::Cancelled);
            }
            Err(e) => {
                self.rollback(tx, tenant_id).await;
                return Err(self.fail_create(tenant_id, progress, e).await);
            }
        };

        progress.step = Some(ProvisioningStep::Commit);
        match cancellable(cancel, tx.commit()).await {
            Ok(()) => {}
            Err(TenantError::Cancelled) => return Err(TenantError::Cancelled),
            Err(e) => return Err(self.fail_create(tenant_id, progress, e).await),
        }

        self.resolver.evict(tenant_id);
        info!(
            tenant_id,
            tenant_code = %tenant.code(),
            database = progress.database.as_deref().unwrap_or_default(),
            "Tenant database created"
        );
        Ok(connection_string.as_str().to_string())
    }

    async fn create_steps(
        &self,
        tx: &mut dyn MasterTransaction,
        tenant_id: TenantId,
        tenant_code: &str,
        cancel: &CancellationToken,
        progress: &mut CreateProgress,
    ) -> TenantResult<(Tenant, Zeroizing<String>)> {
        let db_config = &self.config.database;

        let mut tenant = cancellable(cancel, tx.get_tenant(tenant_id))
            .await?
            .ok_or_else(|| TenantError::NotFound(tenant_id.to_string()))?;
        let code = TenantCode::parse(tenant_code)?;
        if tenant.code() != &code {
            return Err(TenantError::PreconditionFailed(format!(
                "code mismatch: tenant {tenant_id} is {}, not {code}",
                tenant.code()
            )));
        }
        if tenant.database_info().is_some() {
            return Err(TenantError::PreconditionFailed(format!(
                "tenant {code} already has a database"
            )));
        }
        if tenant.status() == TenantStatus::Terminated {
            return Err(TenantError::PreconditionFailed(format!(
                "tenant {code} is terminated"
            )));
        }

        let database = database_name(&db_config.name_pattern, &code, tenant_id);
        if self
            .engine_call(cancel, || self.engine.database_exists(&database))
            .await?
        {
            return Err(TenantError::PreconditionFailed(format!(
                "database {database} already exists"
            )));
        }

        progress.step = Some(ProvisioningStep::CreateDatabase);
        let spec = CreateDatabaseSpec {
            name: database.clone(),
            collation: db_config.collation.clone(),
            recovery_model: db_config.recovery_model,
            compatibility_level: db_config.compatibility_level,
            data_path: db_config.data_path.clone(),
            log_path: db_config.log_path.clone(),
        };
        self.engine_call(cancel, || self.engine.create_database(&spec)).await?;
        progress.database = Some(database.clone());
        debug!(tenant_id, database = %database, "Database created");

        progress.step = Some(ProvisioningStep::CreateLogin);
        let login = login_name(&database);
        let password = generate_password();
        self.engine_call(cancel, || self.engine.create_login(&login, &password, &database))
            .await?;
        progress.login = Some(login.clone());
        debug!(tenant_id, database = %database, login = %login, "Login created");

        progress.step = Some(ProvisioningStep::BuildConnectionString);
        let connection_string = ConnectionString::new()
            .with_server(&db_config.server, db_config.port)
            .with_database(&database)
            .with_credentials(&login, &password)
            .set("Encrypt", db_config.encrypt)
            .with_trust_server_certificate(db_config.trust_server_certificate)
            .set("Connect Timeout", db_config.connect_timeout_secs)
            .set("Command Timeout", db_config.command_timeout_secs)
            .set("Application Name", &db_config.application_name);
        let plain = Zeroizing::new(connection_string.to_string());
        let encrypted_password = self.secrets.encrypt(&password)?;
        let encrypted_connection_string = self.secrets.encrypt(&plain)?;

        progress.step = Some(ProvisioningStep::AttachDatabase);
        let stamp = self.stamp();
        let info = DatabaseInfo::builder(&database, &db_config.server)
            .port(db_config.port)
            .credentials(&login, encrypted_password, encrypted_connection_string)
            .encrypt(db_config.encrypt)
            .trust_server_certificate(db_config.trust_server_certificate)
            .application_name(&db_config.application_name)
            .timeouts(db_config.connect_timeout_secs, db_config.command_timeout_secs)
            .collation(&db_config.collation)
            .recovery_model(db_config.recovery_model)
            .compatibility_level(db_config.compatibility_level)
            .created_at(stamp.at)
            .build()?;
        tenant.attach_database(info, &stamp)?;
        if tenant.settings().is_none() {
            tenant.apply_settings(TenantSettings::default(), &stamp)?;
        }
        if tenant.status() == TenantStatus::Pending {
            tenant.activate(&stamp)?;
        }
        cancellable(cancel, tx.update_tenant(&tenant)).await?;

        Ok((tenant, plain))
    }

    async fn fail_create(
        &self,
        tenant_id: TenantId,
        progress: CreateProgress,
        source: TenantError,
    ) -> TenantError {
        let Some(step) = progress.step else {
            warn!(tenant_id, error = %source, "Tenant database creation refused");
            return source;
        };

        let mut compensation = CompensationOutcome::NotRequired;
        if let Some(login) = &progress.login {
            compensation = compensation
                .and(self.best_effort(tenant_id, "drop login", self.engine.drop_login(login)).await);
        }
        if let Some(database) = &progress.database {
            compensation = compensation.and(
                self.best_effort(tenant_id, "drop database", self.engine.drop_database(database))
                    .await,
            );
        }

        error!(
            tenant_id,
            step = %step,
            compensation = %compensation,
            error = %source,
            "Tenant database creation failed"
        );
        TenantError::ProvisioningFailed {
            tenant_id,
            step,
            compensation,
            source: Box::new(source),
        }
    }

    // ========== Migrate / seed ==========

    /// Apply pending migrations. Returns false when the tenant has no
    /// database.
    pub async fn migrate_tenant_database(
        &self,
        tenant_id: TenantId,
        cancel: &CancellationToken,
    ) -> TenantResult<bool> {
        let tenant = self.load_tenant(tenant_id, cancel).await?;
        let Some(info) = tenant.database_info() else {
            debug!(tenant_id, "No database to migrate");
            return Ok(false);
        };
        info!(tenant_id, database = info.database_name(), "Migrating tenant database");

        let mut conn = self.connect(info, cancel).await?;
        let pending = cancellable(cancel, conn.pending_migrations()).await?;
        if !pending.is_empty() {
            match cancellable(cancel, conn.apply_migrations(&pending)).await {
                Ok(()) => {}
                Err(TenantError::Cancelled) => return Err(TenantError::Cancelled),
                Err(e) => {
                    error!(tenant_id, error = %e, "Migration failed");
                    return Err(TenantError::ProvisioningFailed {
                        tenant_id,
                        step: ProvisioningStep::Migrate,
                        compensation: CompensationOutcome::NotRequired,
                        source: Box::new(e),
                    });
                }
            }
        }
        let schema_version = pending.last().cloned();

        self.update_tenant(tenant_id, cancel, |tenant, stamp| {
            let updated = current_info(tenant)?.with_migration(
                strictly_after(current_info(tenant)?.maintenance().last_migration_date, stamp.at),
                schema_version,
            );
            tenant.record_maintenance(updated, stamp)
        })
        .await?;

        info!(tenant_id, applied = pending.len(), "Tenant database migrated");
        Ok(true)
    }

    /// Write initial data. Returns false when the tenant has no database.
    pub async fn seed_tenant_database(
        &self,
        tenant_id: TenantId,
        cancel: &CancellationToken,
    ) -> TenantResult<bool> {
        let tenant = self.load_tenant(tenant_id, cancel).await?;
        let Some(info) = tenant.database_info() else {
            debug!(tenant_id, "No database to seed");
            return Ok(false);
        };

        let defaults = TenantSettings::default();
        let settings = tenant.settings().unwrap_or(&defaults);
        let plan = SeedPlan {
            tenant_id,
            tenant_code: tenant.code().to_string(),
            tenant_name: tenant.name().to_string(),
            locale: settings.locale().to_string(),
            currency: settings.currency().to_string(),
            timezone: settings.timezone().to_string(),
        };

        let mut conn = self.connect(info, cancel).await?;
        match cancellable(cancel, conn.seed(&plan)).await {
            Ok(()) => {
                info!(tenant_id, database = info.database_name(), "Tenant database seeded");
                Ok(true)
            }
            Err(TenantError::Cancelled) => Err(TenantError::Cancelled),
            Err(e) => {
                error!(tenant_id, error = %e, "Seeding failed");
                Err(TenantError::ProvisioningFailed {
                    tenant_id,
                    step: ProvisioningStep::Seed,
                    compensation: CompensationOutcome::NotRequired,
                    source: Box::new(e),
                })
            }
        }
    }

    // ========== Backup / restore ==========

    /// Full backup with `LastBackupDate` stamped. Failures are logged and
    /// reported as false.
    pub async fn backup_tenant_database(&self, tenant_id: TenantId, cancel: &CancellationToken) -> bool {
        match self.create_backup(tenant_id, cancel).await {
            Ok(_) => true,
            Err(e) => {
                error!(tenant_id, error = %e, "Tenant database backup failed");
                false
            }
        }
    }

    /// Like [`TenantDatabaseService::backup_tenant_database`], returning the
    /// backup file.
    pub async fn create_backup(
        &self,
        tenant_id: TenantId,
        cancel: &CancellationToken,
    ) -> TenantResult<PathBuf> {
        let tenant = self.load_tenant(tenant_id, cancel).await?;
        let info = current_info(&tenant)?;
        let path = self.write_backup(&tenant, info, cancel).await?;

        self.update_tenant(tenant_id, cancel, |tenant, stamp| {
            let info = current_info(tenant)?;
            let updated = info.with_backup(strictly_after(info.maintenance().last_backup_date, stamp.at));
            tenant.record_maintenance(updated, stamp)
        })
        .await?;
        Ok(path)
    }

    /// Backup file path:
    /// `{root}/{code}/{database}_{yyyyMMdd_HHmmss_fff}_{suffix}.bak`.
    ///
    /// The random suffix keeps two backups taken in the same millisecond
    /// from overwriting each other.
    pub fn backup_path(&self, code: &TenantCode, database: &str) -> PathBuf {
        let timestamp = self.clock.now().format("%Y%m%d_%H%M%S_%3f");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.config
            .backup
            .root
            .join(code.as_str())
            .join(format!("{database}_{timestamp}_{}.bak", &suffix[..8]))
    }

    async fn write_backup(
        &self,
        tenant: &Tenant,
        info: &DatabaseInfo,
        cancel: &CancellationToken,
    ) -> TenantResult<PathBuf> {
        let path = self.backup_path(tenant.code(), info.database_name());
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                TenantError::infrastructure(format!("cannot create {}: {e}", dir.display()))
            })?;
        }

        let request = BackupRequest {
            database: info.database_name().to_string(),
            path: path.clone(),
            label: format!("{} full backup", tenant.code()),
            compression: self.config.backup.compression,
            checksum: self.config.backup.checksum,
        };
        info!(tenant_id = tenant.id(), database = info.database_name(), path = %path.display(), "Backing up tenant database");
        self.engine_call(cancel, || self.engine.backup_database(&request)).await?;

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(TenantError::NotFound(format!(
                "backup file {} was not written",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Restore from `backup_path`, replacing the current database.
    ///
    /// Succeeds only if the restored database passes the health checks;
    /// `LastRestoreDate` is stamped only then. The database is always
    /// returned to multi-user mode.
    pub async fn restore_tenant_database(
        &self,
        tenant_id: TenantId,
        backup_path: &Path,
        cancel: &CancellationToken,
    ) -> bool {
        match self.restore(tenant_id, backup_path, cancel).await {
            Ok(restored) => restored,
            Err(e) => {
                error!(tenant_id, path = %backup_path.display(), error = %e, "Tenant database restore failed");
                false
            }
        }
    }

    async fn restore(
        &self,
        tenant_id: TenantId,
        backup_path: &Path,
        cancel: &CancellationToken,
    ) -> TenantResult<bool> {
        if !tokio::fs::try_exists(backup_path).await.unwrap_or(false) {
            warn!(tenant_id, path = %backup_path.display(), "Backup file not found");
            return Ok(false);
        }

        let _guard = self.lock_tenant(tenant_id, cancel).await?;
        let tenant = self.load_tenant(tenant_id, cancel).await?;
        let Some(info) = tenant.database_info() else {
            warn!(tenant_id, "No database to restore");
            return Ok(false);
        };
        let database = info.database_name();
        info!(tenant_id, database, path = %backup_path.display(), "Restoring tenant database");

        self.engine_call(cancel, || self.engine.set_single_user(database)).await?;
        let restored = self
            .engine_call(cancel, || self.engine.restore_database(database, backup_path))
            .await;
        if let Err(e) = self.engine_call(cancel, || self.engine.set_multi_user(database)).await {
            error!(tenant_id, database, error = %e, "Could not return database to multi-user mode");
        }
        restored?;

        if !self.run_health_checks(info, cancel).await? {
            warn!(tenant_id, database, "Restored database failed its health check");
            return Ok(false);
        }

        self.update_tenant(tenant_id, cancel, |tenant, stamp| {
            let info = current_info(tenant)?;
            let updated = info.with_restore(strictly_after(info.maintenance().last_restore_date, stamp.at));
            tenant.record_maintenance(updated, stamp)
        })
        .await?;
        info!(tenant_id, database, "Tenant database restored");
        Ok(true)
    }

    // ========== Health ==========

    /// Online status, schema presence and a transactional round trip.
    ///
    /// On success stamps `LastHealthCheckDate` and reactivates a suspended
    /// tenant. Any failure is logged and reported as false.
    pub async fn check_tenant_database_health(&self, tenant_id: TenantId, cancel: &CancellationToken) -> bool {
        match self.check_health(tenant_id, cancel).await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(tenant_id, error = %e, "Tenant database health check failed");
                false
            }
        }
    }

    async fn check_health(&self, tenant_id: TenantId, cancel: &CancellationToken) -> TenantResult<bool> {
        let tenant = self.load_tenant(tenant_id, cancel).await?;
        let Some(info) = tenant.database_info() else {
            debug!(tenant_id, "No database to check");
            return Ok(false);
        };
        if !self.run_health_checks(info, cancel).await? {
            warn!(tenant_id, database = info.database_name(), "Tenant database is unhealthy");
            return Ok(false);
        }

        let updated = self
            .update_tenant(tenant_id, cancel, |tenant, stamp| {
                let info = current_info(tenant)?;
                let updated = info.with_health_check(strictly_after(
                    info.maintenance().last_health_check_date,
                    stamp.at,
                ));
                tenant.record_maintenance(updated, stamp)?;
                if tenant.status() == TenantStatus::Suspended {
                    tenant.activate(stamp)?;
                }
                Ok(())
            })
            .await?;

        if tenant.status() == TenantStatus::Suspended && updated.is_active() {
            info!(tenant_id, "Suspended tenant reactivated after passing health check");
        }
        debug!(tenant_id, "Tenant database healthy");
        Ok(true)
    }

    async fn run_health_checks(&self, info: &DatabaseInfo, cancel: &CancellationToken) -> TenantResult<bool> {
        let mut conn = self.connect(info, cancel).await?;

        if !cancellable(cancel, conn.is_online()).await? {
            debug!(database = info.database_name(), "Database is not online");
            return Ok(false);
        }
        if cancellable(cancel, conn.base_table_count()).await? == 0 {
            debug!(database = info.database_name(), "Database has no tables");
            return Ok(false);
        }
        let probe = uuid::Uuid::new_v4().to_string();
        cancellable(cancel, conn.round_trip(&probe)).await
    }

    // ========== Delete ==========

    /// Drop the tenant's database and login.
    ///
    /// Takes a safety backup first; if that fails the deletion proceeds
    /// anyway and the report says so. Active subscriptions are cancelled
    /// and the tenant becomes `Inactive` with no database. A dropped
    /// database is never recreated: on failure only the master record is
    /// rolled back.
    pub async fn delete_tenant_database(
        &self,
        tenant_id: TenantId,
        cancel: &CancellationToken,
    ) -> TenantResult<DeletionReport> {
        let _guard = self.lock_tenant(tenant_id, cancel).await?;
        info!(tenant_id, "Deleting tenant database");

        let mut tx = cancellable(cancel, self.store.begin()).await?;
        let mut progress = DeleteProgress::default();

        match self
            .delete_steps(tx.as_mut(), tenant_id, cancel, &mut progress)
            .await
        {
            Ok(report) => {
                progress.step = Some(ProvisioningStep::Commit);
                match cancellable(cancel, tx.commit()).await {
                    Ok(()) => {}
                    Err(TenantError::Cancelled) => return Err(TenantError::Cancelled),
                    Err(e) => return Err(self.fail_delete(tenant_id, progress, e).await),
                }
                self.resolver.evict(tenant_id);
                info!(
                    tenant_id,
                    database = %report.database,
                    cancelled_subscriptions = report.cancelled_subscriptions,
                    "Tenant database deleted"
                );
                Ok(report)
            }
            Err(TenantError::Cancelled) => {
                warn!(tenant_id, step = ?progress.step, "Tenant database deletion cancelled");
                Err(TenantError::Cancelled)
            }
            Err(e) => {
                self.rollback(tx, tenant_id).await;
                Err(self.fail_delete(tenant_id, progress, e).await)
            }
        }
    }

    async fn delete_steps(
        &self,
        tx: &mut dyn MasterTransaction,
        tenant_id: TenantId,
        cancel: &CancellationToken,
        progress: &mut DeleteProgress,
    ) -> TenantResult<DeletionReport> {
        let mut tenant = cancellable(cancel, tx.get_tenant(tenant_id))
            .await?
            .ok_or_else(|| TenantError::NotFound(tenant_id.to_string()))?;
        let info = current_info(&tenant)?.clone();
        let database = info.database_name().to_string();

        let (backup_path, safety_backup) = match self.write_backup(&tenant, &info, cancel).await {
            Ok(path) => (Some(path), CompensationOutcome::Succeeded),
            Err(TenantError::Cancelled) => return Err(TenantError::Cancelled),
            Err(e) => {
                warn!(tenant_id, database = %database, error = %e, "Safety backup failed, deleting without it");
                (None, CompensationOutcome::FailedButContinuing(format!("safety backup: {e}")))
            }
        };

        let now = self.clock.now();
        let mut subscriptions = cancellable(cancel, tx.active_subscriptions(tenant_id)).await?;
        for subscription in &mut subscriptions {
            if subscription.cancel(DELETION_REASON, now) {
                cancellable(cancel, tx.update_subscription(subscription)).await?;
            }
        }

        progress.step = Some(ProvisioningStep::CloseConnections);
        self.engine_call(cancel, || self.engine.set_single_user(&database)).await?;
        progress.single_user = Some(database.clone());

        progress.step = Some(ProvisioningStep::DropDatabase);
        self.engine_call(cancel, || self.engine.drop_database(&database)).await?;
        progress.dropped = true;

        progress.step = Some(ProvisioningStep::DropLogin);
        let login = if info.username().is_empty() {
            login_name(&database)
        } else {
            info.username().to_string()
        };
        if !info.uses_integrated_security() {
            self.engine_call(cancel, || self.engine.drop_login(&login)).await?;
        }

        let stamp = self.stamp();
        tenant.clear_database(&stamp);
        if tenant.status() != TenantStatus::Terminated {
            tenant.deactivate(DELETION_REASON, &stamp)?;
        }
        cancellable(cancel, tx.update_tenant(&tenant)).await?;

        Ok(DeletionReport {
            tenant_id,
            database,
            backup_path,
            safety_backup,
            cancelled_subscriptions: subscriptions.len(),
        })
    }

    async fn fail_delete(&self, tenant_id: TenantId, progress: DeleteProgress, source: TenantError) -> TenantError {
        let Some(step) = progress.step else {
            warn!(tenant_id, error = %source, "Tenant database deletion refused");
            return source;
        };

        let compensation = match (&progress.single_user, progress.dropped) {
            (Some(database), false) => {
                self.best_effort(tenant_id, "restore multi-user mode", self.engine.set_multi_user(database))
                    .await
            }
            _ => CompensationOutcome::NotRequired,
        };

        error!(
            tenant_id,
            step = %step,
            compensation = %compensation,
            error = %source,
            "Tenant database deletion failed"
        );
        TenantError::ProvisioningFailed {
            tenant_id,
            step,
            compensation,
            source: Box::new(source),
        }
    }
}

fn current_info(tenant: &Tenant) -> TenantResult<&DatabaseInfo> {
    tenant.database_info().ok_or_else(|| {
        TenantError::PreconditionFailed(format!("tenant {} has no database", tenant.code()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResolverCache;
    use crate::clock::ManualClock;
    use crate::crypto::AesGcmSecretProvider;
    use crate::error::ErrorKind;
    use crate::memory::{EngineOperation, InMemoryDatabaseEngine, InMemoryMasterStore};
    use crate::resilience::RetryPolicy;
    use crate::tenant::{ModuleSubscription, SubscriptionStatus};
    use chrono::TimeDelta;
    use tempfile::TempDir;

    struct Fixture {
        store: InMemoryMasterStore,
        engine: InMemoryDatabaseEngine,
        secrets: Arc<AesGcmSecretProvider>,
        clock: Arc<ManualClock>,
        resolver: Arc<TenantResolver>,
        service: TenantDatabaseService,
        _backups: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let store = InMemoryMasterStore::new();
            let engine = InMemoryDatabaseEngine::new();
            let secrets = Arc::new(AesGcmSecretProvider::generate());
            let clock = Arc::new(ManualClock::starting_now());
            let backups = tempfile::tempdir().unwrap();

            let mut config = TenancyConfig::default();
            config.database.server = "sql.test".to_string();
            config.backup.root = backups.path().to_path_buf();

            let resolver = Arc::new(TenantResolver::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                ResolverCache::new(clock.clone()),
            ));
            let service = TenantDatabaseService::new(
                Arc::new(store.clone()),
                Arc::new(engine.clone()),
                secrets.clone(),
                Arc::clone(&resolver),
                config,
            )
            .with_clock(clock.clone())
            .with_executor(ResilientExecutor::new("test").with_retry(RetryPolicy::none()));

            Self {
                store,
                engine,
                secrets,
                clock,
                resolver,
                service,
                _backups: backups,
            }
        }

        fn register(&self, id: TenantId, code: &str) {
            let tenant = Tenant::new(
                id,
                format!("{code} Corp"),
                TenantCode::parse(code).unwrap(),
                &AuditStamp::system(self.clock.now()),
            )
            .unwrap();
            self.store.insert_tenant(tenant);
        }

        async fn provisioned(&self, id: TenantId, code: &str) -> Tenant {
            let cancel = CancellationToken::new();
            self.register(id, code);
            self.service.create_tenant_database(id, code, &cancel).await.unwrap();
            assert!(self.service.migrate_tenant_database(id, &cancel).await.unwrap());
            self.store.tenant(id).unwrap()
        }
    }

    #[tokio::test]
    async fn test_create_provisions_and_activates() {
        let fx = Fixture::new();
        fx.register(7, "ACME");
        let cancel = CancellationToken::new();

        let cs = fx.service.create_tenant_database(7, "acme", &cancel).await.unwrap();
        let parsed = ConnectionString::parse(&cs).unwrap();
        assert_eq!(parsed.database(), Some("TenantDB_ACME"));
        assert_eq!(parsed.user_id(), Some("TenantDB_ACME_user"));
        assert_eq!(parsed.server(), Some("sql.test,1433"));

        let tenant = fx.store.tenant(7).unwrap();
        assert_eq!(tenant.status(), TenantStatus::Active);
        assert!(tenant.settings().is_some());
        let info = tenant.database_info().unwrap();
        assert_eq!(info.database_name(), "TenantDB_ACME");
        assert_eq!(fx.secrets.decrypt(info.encrypted_connection_string().unwrap()).unwrap(), cs);
        assert_eq!(
            fx.secrets.decrypt(info.encrypted_password().unwrap()).unwrap(),
            parsed.get("Password").unwrap()
        );

        assert!(fx.engine.has_database("TenantDB_ACME"));
        assert!(fx.engine.has_login("TenantDB_ACME_user"));
        assert_eq!(
            fx.engine.database_spec("TenantDB_ACME").unwrap().collation,
            "SQL_Latin1_General_CP1_CI_AS"
        );
        assert_eq!(fx.store.commits(), 1);
    }

    #[tokio::test]
    async fn test_create_preconditions_have_no_side_effects() {
        let fx = Fixture::new();
        fx.register(7, "ACME");
        let cancel = CancellationToken::new();

        let err = fx.service.create_tenant_database(7, "GLOBEX", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert!(!err.is_partial());

        let err = fx.service.create_tenant_database(99, "ACME", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        fx.register(8, "HOOLI");
        let mut terminated = fx.store.tenant(8).unwrap();
        terminated
            .terminate("Contract ended", &AuditStamp::system(fx.clock.now()))
            .unwrap();
        fx.store.insert_tenant(terminated);
        let err = fx.service.create_tenant_database(8, "HOOLI", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert!(!err.is_partial());
        assert_eq!(fx.engine.call_count(EngineOperation::DatabaseExists), 0);
        assert_eq!(fx.engine.call_count(EngineOperation::CreateLogin), 0);
        assert_eq!(fx.store.tenant(8).unwrap().status(), TenantStatus::Terminated);

        fx.engine.add_database("TenantDB_ACME");
        let err = fx.service.create_tenant_database(7, "ACME", &cancel).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(!err.is_partial());

        assert_eq!(fx.engine.call_count(EngineOperation::CreateDatabase), 0);
        assert_eq!(fx.store.tenant(7).unwrap().status(), TenantStatus::Pending);
        assert_eq!(fx.store.commits(), 0);
    }

    #[tokio::test]
    async fn test_create_login_failure_drops_database() {
        let fx = Fixture::new();
        fx.register(7, "ACME");
        let before = fx.store.tenant(7).unwrap();
        fx.engine.fail_on(EngineOperation::CreateLogin, TenantError::infrastructure("login denied"));

        let err = fx
            .service
            .create_tenant_database(7, "ACME", &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            TenantError::ProvisioningFailed { step, compensation, source, .. } => {
                assert_eq!(*step, ProvisioningStep::CreateLogin);
                assert_eq!(*compensation, CompensationOutcome::Succeeded);
                assert!(source.to_string().contains("login denied"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!fx.engine.has_database("TenantDB_ACME"));
        assert_eq!(fx.store.tenant(7).unwrap(), before);
        assert_eq!(fx.store.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_drops_login_and_database() {
        let fx = Fixture::new();
        fx.register(7, "ACME");
        fx.store.fail_next_commit();

        let err = fx
            .service
            .create_tenant_database(7, "ACME", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_partial());
        assert!(err.is_transient());
        assert!(!fx.engine.has_database("TenantDB_ACME"));
        assert!(!fx.engine.has_login("TenantDB_ACME_user"));
        assert!(fx.store.tenant(7).unwrap().database_info().is_none());
    }

    #[tokio::test]
    async fn test_failed_compensation_is_reported_not_raised() {
        let fx = Fixture::new();
        fx.register(7, "ACME");
        fx.engine.fail_on(EngineOperation::CreateLogin, TenantError::infrastructure("login denied"));
        fx.engine.fail_on(EngineOperation::DropDatabase, TenantError::infrastructure("in use"));

        let err = fx
            .service
            .create_tenant_database(7, "ACME", &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            TenantError::ProvisioningFailed { compensation, .. } => {
                assert!(!compensation.is_clean());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.root().to_string().contains("login denied"));
    }

    #[tokio::test]
    async fn test_cancelled_create_runs_no_compensation() {
        let fx = Fixture::new();
        fx.register(7, "ACME");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx.service.create_tenant_database(7, "ACME", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(fx.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_migrate() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.register(7, "ACME");
        assert!(!fx.service.migrate_tenant_database(7, &cancel).await.unwrap());

        fx.service.create_tenant_database(7, "ACME", &cancel).await.unwrap();
        assert!(fx.service.migrate_tenant_database(7, &cancel).await.unwrap());

        assert_eq!(fx.engine.applied_migrations("TenantDB_ACME").len(), 2);
        assert!(fx.engine.last_connection_string().unwrap().trust_server_certificate());
        let maintenance = fx.store.tenant(7).unwrap().database_info().unwrap().maintenance().clone();
        assert_eq!(maintenance.schema_version.as_deref(), Some("20240215_Inventory"));
        assert!(maintenance.last_migration_date.is_some());

        // Nothing pending: no apply, version kept, date still advances.
        assert!(fx.service.migrate_tenant_database(7, &cancel).await.unwrap());
        assert_eq!(fx.engine.call_count(EngineOperation::ApplyMigrations), 1);
        let again = fx.store.tenant(7).unwrap().database_info().unwrap().maintenance().clone();
        assert_eq!(again.schema_version, maintenance.schema_version);
        assert!(again.last_migration_date > maintenance.last_migration_date);
    }

    #[tokio::test]
    async fn test_seed() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.register(8, "GLOBEX");
        assert!(!fx.service.seed_tenant_database(8, &cancel).await.unwrap());

        fx.provisioned(7, "ACME").await;
        assert!(fx.service.seed_tenant_database(7, &cancel).await.unwrap());
        let plan = fx.engine.seed_plan("TenantDB_ACME").unwrap();
        assert_eq!(plan.tenant_code, "ACME");
        assert_eq!(plan.currency, "USD");
    }

    #[tokio::test]
    async fn test_backup_writes_file_and_stamps() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.provisioned(7, "ACME").await;

        let path = fx.service.create_backup(7, &cancel).await.unwrap();
        assert!(path.exists());
        assert!(path.parent().unwrap().ends_with("ACME"));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("TenantDB_ACME_"));
        let stamped = fx.store.tenant(7).unwrap();
        assert!(stamped.database_info().unwrap().maintenance().last_backup_date.is_some());

        fx.engine.suppress_backup_files(true);
        fx.clock.advance(TimeDelta::seconds(1));
        assert!(!fx.service.backup_tenant_database(7, &cancel).await);
        assert_eq!(
            fx.store.tenant(7).unwrap().database_info().unwrap().maintenance().last_backup_date,
            stamped.database_info().unwrap().maintenance().last_backup_date
        );
    }

    #[tokio::test]
    async fn test_backups_in_same_instant_get_distinct_files() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.provisioned(7, "ACME").await;

        let first = fx.service.create_backup(7, &cancel).await.unwrap();
        let report = fx.service.delete_tenant_database(7, &cancel).await.unwrap();
        let safety = report.backup_path.unwrap();

        assert_ne!(first, safety);
        assert!(first.exists());
        assert!(safety.exists());
    }

    #[tokio::test]
    async fn test_restore() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.provisioned(7, "ACME").await;
        let path = fx.service.create_backup(7, &cancel).await.unwrap();

        assert!(!fx.service.restore_tenant_database(7, Path::new("/nonexistent.bak"), &cancel).await);
        assert_eq!(fx.engine.call_count(EngineOperation::Restore), 0);

        assert!(fx.service.restore_tenant_database(7, &path, &cancel).await);
        assert!(!fx.engine.is_single_user("TenantDB_ACME"));
        let tenant = fx.store.tenant(7).unwrap();
        assert!(tenant.database_info().unwrap().maintenance().last_restore_date.is_some());
    }

    #[tokio::test]
    async fn test_failed_restore_returns_to_multi_user() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.provisioned(7, "ACME").await;
        let path = fx.service.create_backup(7, &cancel).await.unwrap();
        fx.engine.fail_on(EngineOperation::Restore, TenantError::infrastructure("media error"));

        assert!(!fx.service.restore_tenant_database(7, &path, &cancel).await);
        assert!(!fx.engine.is_single_user("TenantDB_ACME"));
        assert!(fx.store.tenant(7).unwrap().database_info().unwrap().maintenance().last_restore_date.is_none());
    }

    #[tokio::test]
    async fn test_health_check_stamps_and_reactivates() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        let mut tenant = fx.provisioned(7, "ACME").await;
        tenant.suspend("health", &AuditStamp::system(fx.clock.now())).unwrap();
        fx.store.insert_tenant(tenant);

        assert!(fx.resolver.resolve_by_id(7).await.unwrap().is_none());

        assert!(fx.service.check_tenant_database_health(7, &cancel).await);
        let tenant = fx.store.tenant(7).unwrap();
        assert_eq!(tenant.status(), TenantStatus::Active);
        assert!(tenant.deactivation_reason().is_none());
        assert!(fx.resolver.resolve_by_id(7).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unhealthy_or_unmigrated_database_fails_check() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.register(7, "ACME");
        assert!(!fx.service.check_tenant_database_health(7, &cancel).await);

        fx.service.create_tenant_database(7, "ACME", &cancel).await.unwrap();
        // No tables before migration.
        assert!(!fx.service.check_tenant_database_health(7, &cancel).await);

        fx.service.migrate_tenant_database(7, &cancel).await.unwrap();
        fx.engine.set_healthy(false);
        assert!(!fx.service.check_tenant_database_health(7, &cancel).await);
        assert!(fx.store.tenant(7).unwrap().database_info().unwrap().maintenance().last_health_check_date.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.provisioned(7, "ACME").await;
        let started = fx.clock.now();
        fx.store.add_subscription(ModuleSubscription::new(1, 7, "CRM", started));
        fx.store.add_subscription(ModuleSubscription::new(2, 7, "INV", started));

        let report = fx.service.delete_tenant_database(7, &cancel).await.unwrap();
        assert_eq!(report.database, "TenantDB_ACME");
        assert_eq!(report.cancelled_subscriptions, 2);
        assert_eq!(report.safety_backup, CompensationOutcome::Succeeded);
        assert!(report.backup_path.unwrap().exists());

        assert!(!fx.engine.has_database("TenantDB_ACME"));
        assert!(!fx.engine.has_login("TenantDB_ACME_user"));
        let tenant = fx.store.tenant(7).unwrap();
        assert_eq!(tenant.status(), TenantStatus::Inactive);
        assert!(tenant.database_info().is_none());
        for sub in fx.store.subscriptions(7) {
            assert_eq!(sub.status, SubscriptionStatus::Cancelled);
            assert_eq!(sub.cancellation_reason.as_deref(), Some(DELETION_REASON));
        }
    }

    #[tokio::test]
    async fn test_delete_proceeds_without_backup() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.provisioned(7, "ACME").await;
        fx.engine.fail_on(EngineOperation::Backup, TenantError::infrastructure("disk full"));

        let report = fx.service.delete_tenant_database(7, &cancel).await.unwrap();
        assert!(!report.safety_backup.is_clean());
        assert!(report.backup_path.is_none());
        assert!(!fx.engine.has_database("TenantDB_ACME"));
    }

    #[tokio::test]
    async fn test_delete_drop_failure_rolls_back_master_record() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        fx.provisioned(7, "ACME").await;
        fx.store.add_subscription(ModuleSubscription::new(1, 7, "CRM", fx.clock.now()));
        fx.engine.fail_on(EngineOperation::DropDatabase, TenantError::infrastructure("locked"));

        let err = fx.service.delete_tenant_database(7, &cancel).await.unwrap_err();
        match &err {
            TenantError::ProvisioningFailed { step, compensation, .. } => {
                assert_eq!(*step, ProvisioningStep::DropDatabase);
                assert_eq!(*compensation, CompensationOutcome::Succeeded);
            }
            other => panic!("unexpected error {other:?}"),
        }

        assert!(!fx.engine.is_single_user("TenantDB_ACME"));
        let tenant = fx.store.tenant(7).unwrap();
        assert_eq!(tenant.status(), TenantStatus::Active);
        assert!(tenant.database_info().is_some());
        assert!(fx.store.subscriptions(7)[0].is_active());
    }

    #[tokio::test]
    async fn test_delete_without_database_is_refused() {
        let fx = Fixture::new();
        fx.register(7, "ACME");
        let err = fx
            .service
            .delete_tenant_database(7, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert!(!err.is_partial());
    }
}
