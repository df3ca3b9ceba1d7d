use claimwatch_domain::storage::{StorageError, StorageResult};
use sea_orm::sea_query::{ColumnDef, Expr, Index, Table, TableCreateStatement};
use sea_orm::{ConnectionTrait, DatabaseConnection};

use crate::entity::deposits;

pub async fn run_migrations(db: &DatabaseConnection) -> StorageResult<()> {
    let deposits_table = Table::create()
        .table(deposits::Entity)
        .col(
            ColumnDef::new(deposits::Column::Signature)
                .string_len(88)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(deposits::Column::Source)
                .string_len(44)
                .not_null(),
        )
        .col(
            ColumnDef::new(deposits::Column::Destination)
                .string_len(44)
                .not_null(),
        )
        .col(
            ColumnDef::new(deposits::Column::Amount)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(deposits::Column::ObservedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(deposits::Column::CreatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned();
    create_table(db, deposits_table).await?;

    let created_at_index = Index::create()
        .if_not_exists()
        .name("idx_deposits_created_at")
        .table(deposits::Entity)
        .col(deposits::Column::CreatedAt)
        .to_owned();
    let backend = db.get_database_backend();
    db.execute(backend.build(&created_at_index))
        .await
        .map_err(StorageError::from_source)?;

    Ok(())
}

async fn create_table(
    db: &DatabaseConnection,
    mut statement: TableCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    let backend = db.get_database_backend();
    db.execute(backend.build(&statement))
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}
