mod common;

use common::{init_test_context, migration, top_level_catalog, PATIENT_QUERY};
use rusqlite::Connection;
use std::sync::Arc;
use vaultsync::catalog::EntityDescriptor;
use vaultsync::db::{SqliteSource, SqliteTarget};
use vaultsync::errors::MigrationError;
use vaultsync::models::{EntityKey, TargetType, TaskKey, TaskOutcome};
use vaultsync::reporter::EntityStatus;
use vaultsync::Migration;

#[tokio::test]
async fn test_top_level_entities_migrate_in_order() -> anyhow::Result<()> {
    let ctx = init_test_context()?;
    let migration = migration(&ctx, top_level_catalog())?;

    let report = migration.run().await?;

    let counts = ctx.target.universal_counts().await?;
    assert_eq!(counts["organization"], 3);
    assert_eq!(counts["practitioner"], 5);
    assert_eq!(report.rows_transferred(), 8);

    let org_sync = report
        .record(&TaskKey::Sync(EntityKey::Organization))
        .expect("organization sync recorded");
    let practitioner_sync = report
        .record(&TaskKey::Sync(EntityKey::Practitioner))
        .expect("practitioner sync recorded");
    assert!(org_sync.finished_at <= practitioner_sync.started_at);

    // Every practitioner resolved its organization.
    let conn = Connection::open(&ctx.target_path)?;
    let orphans: i64 = conn.query_row(
        "SELECT COUNT(*) FROM practitioner WHERE organization_id IS NULL",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(orphans, 0);
    let hopper_org: String = conn.query_row(
        "SELECT o.name FROM practitioner p JOIN organization o ON o.id = p.organization_id
         WHERE p.name = 'Grace Hopper'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(hopper_org, "South");

    let progress = migration.reporter().snapshot();
    assert_eq!(progress["practitioner"].status, EntityStatus::Done);
    assert_eq!(progress["practitioner"].rows_inserted, 5);
    Ok(())
}

#[tokio::test]
async fn test_empty_entity_completes_without_rows() -> anyhow::Result<()> {
    let ctx = init_test_context()?;
    let mut descriptors = top_level_catalog().descriptors().to_vec();
    descriptors.push(
        EntityDescriptor::new(TargetType::Patient, PATIENT_QUERY).with_source_table("demographic"),
    );
    let migration = migration(&ctx, vaultsync::catalog::EntityCatalog::new(descriptors))?;

    let report = migration.run().await?;

    let counts = ctx.target.universal_counts().await?;
    assert_eq!(counts["patient"], 0);
    let transfer = report
        .record(&TaskKey::Transfer(EntityKey::Patient))
        .expect("patient transfer recorded");
    assert!(matches!(
        transfer.outcome,
        Some(TaskOutcome::Transferred(stats)) if stats.rows_written == 0
    ));
    assert!(report.record(&TaskKey::Sync(EntityKey::Patient)).is_some());
    Ok(())
}

#[tokio::test]
async fn test_rerun_does_not_duplicate_records() -> anyhow::Result<()> {
    let ctx = init_test_context()?;

    migration(&ctx, top_level_catalog())?.run().await?;
    let first = ctx.target.universal_counts().await?;
    migration(&ctx, top_level_catalog())?.run().await?;
    let second = ctx.target.universal_counts().await?;

    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn test_failing_query_halts_dependent_sync() -> anyhow::Result<()> {
    let ctx = init_test_context()?;
    let catalog = vaultsync::catalog::EntityCatalog::new(vec![
        top_level_catalog().descriptors()[0].clone(),
        EntityDescriptor::new(
            TargetType::Practitioner,
            "SELECT * FROM no_such_table LIMIT {offset}, {limit}",
        ),
    ]);

    let err = migration(&ctx, catalog)?.run().await.unwrap_err();

    match &err {
        MigrationError::Task { task, .. } => assert_eq!(task, "transfer-practitioner"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(err.root_cause(), MigrationError::SQLite(_)));
    assert_eq!(ctx.target.universal_counts().await?["practitioner"], 0);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_source_gives_up() -> anyhow::Result<()> {
    let ctx = init_test_context()?;
    let config = common::small_config();
    let source = Arc::new(SqliteSource::open(ctx.temp_dir.path().join("missing.sqlite"), 1));
    let migration = Migration::new(config, top_level_catalog(), source, ctx.target.clone())?;

    let err = migration.run().await.unwrap_err();

    assert!(matches!(
        err,
        MigrationError::ConnectionUnavailable { attempts: 2, .. }
    ));
    Ok(())
}

#[tokio::test]
async fn test_export_writes_one_file_per_entity() -> anyhow::Result<()> {
    let ctx = init_test_context()?;
    let migration = migration(&ctx, top_level_catalog())?;
    let out = ctx.temp_dir.path().join("export");

    let report = migration.export(&out).await?;

    assert_eq!(report.rows_transferred(), 8);
    let clinics = std::fs::read_to_string(out.join("organization.csv"))?;
    let mut lines: Vec<&str> = clinics.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["East,\\N,3,clinic", "North,\\N,1,clinic", "South,\\N,2,clinic"]);
    assert_eq!(
        std::fs::read_to_string(out.join("practitioner.csv"))?.lines().count(),
        5
    );
    Ok(())
}

#[tokio::test]
async fn test_exported_files_import_into_fresh_target() -> anyhow::Result<()> {
    let ctx = init_test_context()?;
    let out = ctx.temp_dir.path().join("export");
    migration(&ctx, top_level_catalog())?.export(&out).await?;

    let imported_path = ctx.temp_dir.path().join("imported.sqlite");
    let imported = Arc::new(SqliteTarget::open(&imported_path, 2));
    let source = Arc::new(SqliteSource::open(&ctx.source_path, 1));
    let importer = Migration::new(
        common::small_config(),
        top_level_catalog(),
        source,
        imported.clone(),
    )?;

    let report = importer.import(&out).await?;

    assert_eq!(report.rows_transferred(), 8);
    assert!(matches!(
        report.record(&TaskKey::Load(EntityKey::Practitioner)).and_then(|r| r.outcome.clone()),
        Some(TaskOutcome::Loaded { stats, .. }) if stats.rows_written == 5
    ));
    let counts = imported.universal_counts().await?;
    assert_eq!(counts["organization"], 3);
    assert_eq!(counts["practitioner"], 5);

    let conn = Connection::open(&imported_path)?;
    let hopper_org: String = conn.query_row(
        "SELECT o.name FROM practitioner p JOIN organization o ON o.id = p.organization_id
         WHERE p.name = 'Grace Hopper'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(hopper_org, "South");
    let null_refs: i64 = conn.query_row(
        "SELECT COUNT(*) FROM organization WHERE external_reference IS NULL",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(null_refs, 3);

    // Importing the same files again updates in place.
    importer.import(&out).await?;
    assert_eq!(imported.universal_counts().await?, counts);
    Ok(())
}

#[tokio::test]
async fn test_import_rejects_unknown_file() -> anyhow::Result<()> {
    let ctx = init_test_context()?;
    let dir = ctx.temp_dir.path().join("incoming");
    std::fs::create_dir(&dir)?;
    std::fs::write(dir.join("organization.csv"), "North,\\N,1,clinic\n")?;
    std::fs::write(dir.join("invoices.csv"), "1,2\n")?;

    let err = migration(&ctx, top_level_catalog())?
        .import(&dir)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Config(ref msg) if msg.contains("invoices.csv")));
    // Rejected before the universal schema is created.
    assert!(ctx.target.universal_counts().await.is_err());
    Ok(())
}
