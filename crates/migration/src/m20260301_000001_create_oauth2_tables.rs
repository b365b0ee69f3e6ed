//! OAuth2 client registry and single-use authorization codes.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OAuth2Client::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuth2Client::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OAuth2Client::Secret).string().not_null())
                    .col(ColumnDef::new(OAuth2Client::Name).string().not_null())
                    .col(
                        ColumnDef::new(OAuth2Client::RedirectUris)
                            .text()
                            .not_null()
                            .default("[]"),
                    )
                    .col(
                        ColumnDef::new(OAuth2Client::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(OAuth2AuthorizationCode::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuth2AuthorizationCode::Code)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(OAuth2AuthorizationCode::ClientId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuth2AuthorizationCode::RedirectUri)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuth2AuthorizationCode::CodeChallenge)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuth2AuthorizationCode::Scope)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuth2AuthorizationCode::BoundToken)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuth2AuthorizationCode::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuth2AuthorizationCode::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // The purge task scans by expiry
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_oauth2_authorization_code_expires_at")
                    .table(OAuth2AuthorizationCode::Table)
                    .col(OAuth2AuthorizationCode::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(OAuth2AuthorizationCode::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(OAuth2Client::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OAuth2Client {
    #[sea_orm(iden = "oauth2_client")]
    Table,
    Id,
    Secret,
    Name,
    RedirectUris,
    CreatedAt,
}

#[derive(DeriveIden)]
enum OAuth2AuthorizationCode {
    #[sea_orm(iden = "oauth2_authorization_code")]
    Table,
    Code,
    ClientId,
    RedirectUri,
    CodeChallenge,
    Scope,
    BoundToken,
    CreatedAt,
    ExpiresAt,
}
