//! End-to-end tenant workflows.
//!
//! Each test wires the real services over the in-memory master store and
//! database engine, the way a host process wires them over SQL Server.

use bizhub::tenancy::*;
use chrono::TimeDelta;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Harness
// =============================================================================

struct Platform {
    store: InMemoryMasterStore,
    engine: InMemoryDatabaseEngine,
    secrets: Arc<AesGcmSecretProvider>,
    clock: Arc<ManualClock>,
    resolver: Arc<TenantResolver>,
    databases: Arc<TenantDatabaseService>,
    tenants: TenantService,
    _backups: TempDir,
}

impl Platform {
    fn new() -> Self {
        let store = InMemoryMasterStore::new();
        let engine = InMemoryDatabaseEngine::new();
        let secrets = Arc::new(AesGcmSecretProvider::generate());
        let clock = Arc::new(ManualClock::starting_now());
        let backups = tempfile::tempdir().unwrap();

        let mut config = TenancyConfig::default();
        config.database.server = "sql.bizhub.local".to_string();
        config.backup.root = backups.path().to_path_buf();

        let resolver = Arc::new(TenantResolver::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            config.resolver.build_cache(clock.clone()),
        ));
        let databases = Arc::new(
            TenantDatabaseService::new(
                Arc::new(store.clone()),
                Arc::new(engine.clone()),
                secrets.clone(),
                Arc::clone(&resolver),
                config,
            )
            .with_clock(clock.clone())
            .with_executor(ResilientExecutor::new("workflows").with_retry(RetryPolicy::none())),
        );
        let tenants = TenantService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::clone(&databases),
            Arc::clone(&resolver),
        )
        .with_clock(clock.clone());

        Self {
            store,
            engine,
            secrets,
            clock,
            resolver,
            databases,
            tenants,
            _backups: backups,
        }
    }

    /// Seed a `Pending` tenant with a fixed id, as an import would.
    fn pending_tenant(&self, id: TenantId, code: &str, name: &str) {
        let tenant = Tenant::new(
            id,
            name,
            TenantCode::parse(code).unwrap(),
            &AuditStamp::system(self.clock.now()),
        )
        .unwrap();
        self.store.insert_tenant(tenant);
    }

    fn context(&self) -> TenantContext {
        TenantContext::new(
            Arc::clone(&self.resolver),
            Arc::new(self.store.clone()),
            self.secrets.clone(),
        )
    }
}

// =============================================================================
// Provisioning
// =============================================================================

#[tokio::test]
async fn test_create_database_for_new_tenant() {
    let platform = Platform::new();
    let cancel = CancellationToken::new();
    platform.pending_tenant(7, "ACME", "Acme Corp");

    let connection = platform
        .databases
        .create_tenant_database(7, "ACME", &cancel)
        .await
        .unwrap();

    let parsed = ConnectionString::parse(&connection).unwrap();
    assert_eq!(parsed.database(), Some("TenantDB_ACME"));
    assert!(platform.engine.has_database("TenantDB_ACME"));

    let tenant = platform.store.tenant(7).unwrap();
    assert_eq!(tenant.status(), TenantStatus::Active);
    let info = tenant.database_info().unwrap();
    assert_eq!(info.database_name(), "TenantDB_ACME");
    assert_eq!(
        platform
            .secrets
            .decrypt(info.encrypted_connection_string().unwrap())
            .unwrap(),
        connection
    );

    // The tenant is now reachable by code from a request.
    let resolved = platform.resolver.resolve_by_code("acme").await.unwrap();
    assert_eq!(resolved.unwrap().id(), 7);
}

#[tokio::test]
async fn test_failed_login_rolls_back_database() {
    let platform = Platform::new();
    platform.pending_tenant(7, "ACME", "Acme Corp");
    platform.engine.fail_on(
        EngineOperation::CreateLogin,
        TenantError::infrastructure("password policy"),
    );

    let err = platform
        .databases
        .create_tenant_database(7, "ACME", &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        TenantError::ProvisioningFailed {
            tenant_id,
            step,
            compensation,
            ..
        } => {
            assert_eq!(*tenant_id, 7);
            assert_eq!(*step, ProvisioningStep::CreateLogin);
            assert_eq!(*compensation, CompensationOutcome::Succeeded);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!platform.engine.has_database("TenantDB_ACME"));

    let tenant = platform.store.tenant(7).unwrap();
    assert_eq!(tenant.status(), TenantStatus::Pending);
    assert!(tenant.database_info().is_none());
}

#[tokio::test]
async fn test_register_and_provision_end_to_end() {
    let platform = Platform::new();
    let cancel = CancellationToken::new();

    let tenant = platform
        .tenants
        .register_tenant(NewTenant::new("globex", "Globex Corporation"))
        .await
        .unwrap();
    assert_eq!(tenant.status(), TenantStatus::Pending);

    platform
        .tenants
        .provision_tenant(tenant.id(), "GLOBEX", &cancel)
        .await
        .unwrap();

    assert_eq!(platform.engine.applied_migrations("TenantDB_GLOBEX").len(), 2);
    let plan = platform.engine.seed_plan("TenantDB_GLOBEX").unwrap();
    assert_eq!(plan.tenant_code, "GLOBEX");

    let stored = platform.store.tenant(tenant.id()).unwrap();
    assert!(stored.is_active());
    let maintenance = stored.database_info().unwrap().maintenance();
    assert!(maintenance.last_migration_date.is_some());
    assert_eq!(maintenance.schema_version.as_deref(), Some("20240215_Inventory"));
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test]
async fn test_delete_cancels_active_subscriptions() {
    let platform = Platform::new();
    let cancel = CancellationToken::new();
    platform.pending_tenant(9, "INITECH", "Initech");
    platform
        .databases
        .create_tenant_database(9, "INITECH", &cancel)
        .await
        .unwrap();

    let started = platform.clock.now();
    platform.store.add_subscription(ModuleSubscription::new(1, 9, "CRM", started));
    platform.store.add_subscription(ModuleSubscription::new(2, 9, "INVENTORY", started));
    let mut expired = ModuleSubscription::new(3, 9, "HR", started);
    expired.status = SubscriptionStatus::Expired;
    platform.store.add_subscription(expired);

    let report = platform
        .databases
        .delete_tenant_database(9, &cancel)
        .await
        .unwrap();

    assert_eq!(report.cancelled_subscriptions, 2);
    assert_eq!(report.safety_backup, CompensationOutcome::Succeeded);
    assert!(report.backup_path.as_ref().unwrap().exists());
    assert!(!platform.engine.has_database("TenantDB_INITECH"));
    assert!(!platform.engine.has_login("TenantDB_INITECH_user"));

    let subscriptions = platform.store.subscriptions(9);
    let cancelled: Vec<_> = subscriptions
        .iter()
        .filter(|s| s.status == SubscriptionStatus::Cancelled)
        .collect();
    assert_eq!(cancelled.len(), 2);
    assert!(
        cancelled
            .iter()
            .all(|s| s.cancellation_reason.as_deref() == Some("Database deletion"))
    );

    let tenant = platform.store.tenant(9).unwrap();
    assert_eq!(tenant.status(), TenantStatus::Inactive);
    assert!(tenant.database_info().is_none());
    assert!(platform.resolver.resolve_by_id(9).await.unwrap().is_none());
}

// =============================================================================
// Backup, restore, health
// =============================================================================

#[tokio::test]
async fn test_restore_of_unmigrated_backup_fails_health_check() {
    let platform = Platform::new();
    let cancel = CancellationToken::new();
    platform.pending_tenant(7, "ACME", "Acme Corp");
    platform
        .databases
        .create_tenant_database(7, "ACME", &cancel)
        .await
        .unwrap();

    // Taken before any migration: the restored database has no tables.
    let empty_backup = platform.databases.create_backup(7, &cancel).await.unwrap();
    platform.clock.advance(TimeDelta::seconds(1));
    assert!(
        platform
            .databases
            .migrate_tenant_database(7, &cancel)
            .await
            .unwrap()
    );

    assert!(
        !platform
            .databases
            .restore_tenant_database(7, &empty_backup, &cancel)
            .await
    );
    assert!(!platform.engine.is_single_user("TenantDB_ACME"));
    let maintenance = platform
        .store
        .tenant(7)
        .unwrap()
        .database_info()
        .unwrap()
        .maintenance()
        .clone();
    assert!(maintenance.last_restore_date.is_none());
    assert!(maintenance.last_backup_date.is_some());
}

#[tokio::test]
async fn test_health_checks_stamp_strictly_later() {
    let platform = Platform::new();
    let cancel = CancellationToken::new();
    platform.pending_tenant(7, "ACME", "Acme Corp");
    platform
        .tenants
        .provision_tenant(7, "ACME", &cancel)
        .await
        .unwrap();

    let health_date = |platform: &Platform| {
        platform
            .store
            .tenant(7)
            .unwrap()
            .database_info()
            .unwrap()
            .maintenance()
            .last_health_check_date
            .unwrap()
    };

    // Clock frozen between the two checks.
    assert!(platform.databases.check_tenant_database_health(7, &cancel).await);
    let first = health_date(&platform);
    assert!(platform.databases.check_tenant_database_health(7, &cancel).await);
    let second = health_date(&platform);
    assert!(second > first);

    platform.engine.set_healthy(false);
    assert!(!platform.databases.check_tenant_database_health(7, &cancel).await);
    assert_eq!(health_date(&platform), second);
}

// =============================================================================
// Resolution and request context
// =============================================================================

#[tokio::test]
async fn test_resolver_cache_expiry_and_inactive_tenants() {
    let platform = Platform::new();
    let cancel = CancellationToken::new();
    platform.pending_tenant(7, "ACME", "Acme Corp");
    platform.pending_tenant(8, "HOOLI", "Hooli");
    platform
        .databases
        .create_tenant_database(7, "ACME", &cancel)
        .await
        .unwrap();

    let base = platform.store.get_by_code_calls();
    assert!(platform.resolver.resolve_by_code("ACME").await.unwrap().is_some());
    assert!(platform.resolver.resolve_by_code("acme").await.unwrap().is_some());
    assert_eq!(platform.store.get_by_code_calls(), base + 1);

    // Sliding expiration is 30 minutes by default.
    platform.clock.advance(TimeDelta::minutes(29));
    assert!(platform.resolver.resolve_by_code("ACME").await.unwrap().is_some());
    assert_eq!(platform.store.get_by_code_calls(), base + 1);

    platform.clock.advance(TimeDelta::minutes(31));
    assert!(platform.resolver.resolve_by_code("ACME").await.unwrap().is_some());
    assert_eq!(platform.store.get_by_code_calls(), base + 2);

    // Pending tenants are never resolved.
    assert!(platform.resolver.resolve_by_code("HOOLI").await.unwrap().is_none());
    assert!(platform.resolver.resolve_by_id(8).await.unwrap().is_none());
}

#[tokio::test]
async fn test_context_gates_access_by_membership() {
    let platform = Platform::new();
    let cancel = CancellationToken::new();
    platform.pending_tenant(7, "ACME", "Acme Corp");
    platform.pending_tenant(8, "GLOBEX", "Globex");
    for (id, code) in [(7, "ACME"), (8, "GLOBEX")] {
        platform
            .databases
            .create_tenant_database(id, code, &cancel)
            .await
            .unwrap();
    }
    platform
        .store
        .add_user(TenantUser::new(1, 7, "jane@acme.com", "Jane"));

    let request = RequestInfo::new()
        .with_header("x-tenant-id", "ACME")
        .with_principal(Principal::new("Jane@Acme.com"));
    let mut context = platform.context();
    assert!(context.initialize(&request).await);
    assert_eq!(context.state(), BindingState::BoundWithUser);
    assert!(context.validate_tenant_access());
    let connection = context.database_connection().unwrap();
    assert_eq!(connection.database(), Some("TenantDB_ACME"));

    // Same user asking for another tenant.
    let request = RequestInfo::new()
        .with_header("X-Tenant-Id", "GLOBEX")
        .with_principal(Principal::new("jane@acme.com"));
    let mut context = platform.context();
    assert!(context.initialize(&request).await);
    assert_eq!(context.tenant_id(), Some(8));
    assert!(!context.validate_tenant_access());

    // No candidate at all besides the email.
    let request = RequestInfo::new().with_principal(Principal::new("jane@acme.com"));
    let mut context = platform.context();
    assert!(context.initialize(&request).await);
    assert_eq!(context.tenant_id(), Some(7));

    // Suspended tenants do not bind.
    platform.tenants.suspend(7, "Payment overdue").await.unwrap();
    let request = RequestInfo::new()
        .with_query_string("?tenant=ACME")
        .with_principal(Principal::new("jane@acme.com"));
    let mut context = platform.context();
    assert!(!context.initialize(&request).await);
    assert_eq!(context.state(), BindingState::Unbound);
    assert!(context.connection_string().is_none());
}
