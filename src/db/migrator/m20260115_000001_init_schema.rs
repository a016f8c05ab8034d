//! Initial schema: users, tunnels, and the stats/log/device-code tables.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Users::Id).string().not_null().primary_key())
                    .col(
                        ColumnDef::new(Users::Email)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Users::Name).string())
                    .col(
                        ColumnDef::new(Users::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Tunnels::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tunnels::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Tunnels::Subdomain)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Tunnels::UserId).string().not_null())
                    .col(ColumnDef::new(Tunnels::Name).string().not_null())
                    .col(ColumnDef::new(Tunnels::Description).text())
                    .col(ColumnDef::new(Tunnels::LocalPort).integer())
                    .col(ColumnDef::new(Tunnels::Protocol).string().not_null())
                    .col(ColumnDef::new(Tunnels::CustomDomain).string())
                    .col(ColumnDef::new(Tunnels::IsActive).boolean().not_null())
                    .col(ColumnDef::new(Tunnels::ConnectedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Tunnels::LastConnected).timestamp_with_time_zone())
                    .col(ColumnDef::new(Tunnels::LastDisconnected).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Tunnels::TotalRequests)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Tunnels::TotalBandwidth)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Tunnels::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnels_user_id")
                            .from(Tunnels::Table, Tunnels::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LiveStats::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LiveStats::TunnelId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LiveStats::RequestsLast5Min)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LiveStats::RequestsLast1Hour)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LiveStats::AvgResponseTime)
                            .double()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LiveStats::ErrorRate).integer().not_null())
                    .col(
                        ColumnDef::new(LiveStats::LastUpdated)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_live_stats_tunnel_id")
                            .from(LiveStats::Table, LiveStats::TunnelId)
                            .to(Tunnels::Table, Tunnels::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(HourlyStats::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(HourlyStats::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(HourlyStats::TunnelId).string().not_null())
                    .col(
                        ColumnDef::new(HourlyStats::Hour)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(HourlyStats::TotalRequests)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(HourlyStats::SuccessRequests)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(HourlyStats::ErrorRequests)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(HourlyStats::AvgResponseTime)
                            .double()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(HourlyStats::TotalBandwidth)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(HourlyStats::UniqueVisitors)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(HourlyStats::TopPaths).text().not_null())
                    .col(ColumnDef::new(HourlyStats::TopCountries).text().not_null())
                    .col(ColumnDef::new(HourlyStats::StatusCodes).text().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_hourly_stats_tunnel_id")
                            .from(HourlyStats::Table, HourlyStats::TunnelId)
                            .to(Tunnels::Table, Tunnels::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_hourly_stats_tunnel_hour")
                    .table(HourlyStats::Table)
                    .col(HourlyStats::TunnelId)
                    .col(HourlyStats::Hour)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DailyStats::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DailyStats::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DailyStats::TunnelId).string().not_null())
                    .col(ColumnDef::new(DailyStats::Date).date().not_null())
                    .col(
                        ColumnDef::new(DailyStats::TotalRequests)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DailyStats::SuccessRequests)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DailyStats::ErrorRequests)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DailyStats::AvgResponseTime)
                            .double()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DailyStats::TotalBandwidth)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DailyStats::UniqueVisitors)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DailyStats::PeakHour).integer().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_daily_stats_tunnel_id")
                            .from(DailyStats::Table, DailyStats::TunnelId)
                            .to(Tunnels::Table, Tunnels::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_daily_stats_tunnel_date")
                    .table(DailyStats::Table)
                    .col(DailyStats::TunnelId)
                    .col(DailyStats::Date)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RequestLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RequestLogs::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RequestLogs::TunnelId).string().not_null())
                    .col(ColumnDef::new(RequestLogs::Path).string().not_null())
                    .col(ColumnDef::new(RequestLogs::Method).string().not_null())
                    .col(ColumnDef::new(RequestLogs::StatusCode).integer().not_null())
                    .col(
                        ColumnDef::new(RequestLogs::ResponseTime)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RequestLogs::RequestSize)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RequestLogs::ResponseSize)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RequestLogs::ClientIp).string().not_null())
                    .col(ColumnDef::new(RequestLogs::Country).string())
                    .col(ColumnDef::new(RequestLogs::UserAgent).text())
                    .col(
                        ColumnDef::new(RequestLogs::Timestamp)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_request_logs_tunnel_id")
                            .from(RequestLogs::Table, RequestLogs::TunnelId)
                            .to(Tunnels::Table, Tunnels::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_request_logs_tunnel_id")
                    .table(RequestLogs::Table)
                    .col(RequestLogs::TunnelId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_request_logs_timestamp")
                    .table(RequestLogs::Table)
                    .col(RequestLogs::Timestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DeviceAuthCodes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceAuthCodes::Code)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeviceAuthCodes::UserId).string())
                    .col(ColumnDef::new(DeviceAuthCodes::Token).text())
                    .col(
                        ColumnDef::new(DeviceAuthCodes::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeviceAuthCodes::IsUsed).boolean().not_null())
                    .col(
                        ColumnDef::new(DeviceAuthCodes::Claimed)
                            .boolean()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceAuthCodes::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_device_auth_codes_user_id")
                            .from(DeviceAuthCodes::Table, DeviceAuthCodes::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_device_auth_codes_expires_at")
                    .table(DeviceAuthCodes::Table)
                    .col(DeviceAuthCodes::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeviceAuthCodes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RequestLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DailyStats::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(HourlyStats::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LiveStats::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tunnels::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    Email,
    Name,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Tunnels {
    Table,
    Id,
    Subdomain,
    UserId,
    Name,
    Description,
    LocalPort,
    Protocol,
    CustomDomain,
    IsActive,
    ConnectedAt,
    LastConnected,
    LastDisconnected,
    TotalRequests,
    TotalBandwidth,
    CreatedAt,
}

#[derive(DeriveIden)]
enum LiveStats {
    Table,
    TunnelId,
    #[sea_orm(iden = "requests_last_5_min")]
    RequestsLast5Min,
    #[sea_orm(iden = "requests_last_1_hour")]
    RequestsLast1Hour,
    AvgResponseTime,
    ErrorRate,
    LastUpdated,
}

#[derive(DeriveIden)]
enum HourlyStats {
    Table,
    Id,
    TunnelId,
    Hour,
    TotalRequests,
    SuccessRequests,
    ErrorRequests,
    AvgResponseTime,
    TotalBandwidth,
    UniqueVisitors,
    TopPaths,
    TopCountries,
    StatusCodes,
}

#[derive(DeriveIden)]
enum DailyStats {
    Table,
    Id,
    TunnelId,
    Date,
    TotalRequests,
    SuccessRequests,
    ErrorRequests,
    AvgResponseTime,
    TotalBandwidth,
    UniqueVisitors,
    PeakHour,
}

#[derive(DeriveIden)]
enum RequestLogs {
    Table,
    Id,
    TunnelId,
    Path,
    Method,
    StatusCode,
    ResponseTime,
    RequestSize,
    ResponseSize,
    ClientIp,
    Country,
    UserAgent,
    Timestamp,
}

#[derive(DeriveIden)]
enum DeviceAuthCodes {
    Table,
    Code,
    UserId,
    Token,
    ExpiresAt,
    IsUsed,
    Claimed,
    CreatedAt,
}
