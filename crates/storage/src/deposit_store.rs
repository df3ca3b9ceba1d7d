use chrono::Utc;
use claimwatch_domain::model::{DepositRecord, NewDeposit};
use claimwatch_domain::storage::{DepositStore, StorageError, StorageResult};
use sea_orm::sea_query::OnConflict;
use sea_orm::{EntityTrait, QueryOrder, QuerySelect, Set};

use crate::entity::deposits;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl DepositStore for SeaOrmStorage {
    async fn insert_deposit(&self, deposit: NewDeposit) -> StorageResult<bool> {
        let amount = i64::try_from(deposit.amount).map_err(StorageError::from_source)?;
        let model = deposits::ActiveModel {
            signature: Set(deposit.signature),
            source: Set(deposit.source),
            destination: Set(deposit.destination),
            amount: Set(amount),
            observed_at: Set(deposit.observed_at),
            created_at: Set(Utc::now()),
        };
        let inserted = deposits::Entity::insert(model)
            .on_conflict(
                OnConflict::column(deposits::Column::Signature)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(inserted > 0)
    }

    async fn find_deposit(&self, signature: &str) -> StorageResult<Option<DepositRecord>> {
        let maybe = deposits::Entity::find_by_id(signature.to_string())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        maybe.map(deposit_to_record).transpose()
    }

    async fn recent_signatures(&self, limit: u64) -> StorageResult<Vec<String>> {
        deposits::Entity::find()
            .select_only()
            .column(deposits::Column::Signature)
            .order_by_desc(deposits::Column::CreatedAt)
            .order_by_desc(deposits::Column::ObservedAt)
            .limit(limit)
            .into_tuple::<String>()
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)
    }
}

fn deposit_to_record(model: deposits::Model) -> StorageResult<DepositRecord> {
    let amount = u64::try_from(model.amount).map_err(StorageError::from_source)?;
    Ok(DepositRecord {
        signature: model.signature,
        source: model.source,
        destination: model.destination,
        amount,
        observed_at: model.observed_at,
        created_at: model.created_at,
    })
}
