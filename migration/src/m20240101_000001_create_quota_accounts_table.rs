use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QuotaAccounts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(QuotaAccounts::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(QuotaAccounts::Scope)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QuotaAccounts::AccountId)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QuotaAccounts::Quota)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(QuotaAccounts::UsedQuota)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(QuotaAccounts::CounterSnapshot).big_integer())
                    .col(
                        ColumnDef::new(QuotaAccounts::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(QuotaAccounts::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // 同一层级下账户唯一
        manager
            .create_index(
                Index::create()
                    .name("idx_quota_accounts_scope_account")
                    .table(QuotaAccounts::Table)
                    .col(QuotaAccounts::Scope)
                    .col(QuotaAccounts::AccountId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(QuotaAccounts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QuotaAccounts {
    Table,
    Id,
    Scope,
    AccountId,
    Quota,
    UsedQuota,
    CounterSnapshot,
    CreatedAt,
    UpdatedAt,
}
