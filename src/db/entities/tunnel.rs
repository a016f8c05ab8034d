//! Tunnel entity: a named, owned forwarding endpoint.
//!
//! `subdomain` is unique across all tunnels and doubles as the URL path
//! prefix. The live registry owns mutation of `is_active` and the
//! connect/disconnect timestamps while a session is bound.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(unique)]
    pub subdomain: String,

    pub user_id: String,

    pub name: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    /// Advisory only; the server never opens it.
    pub local_port: Option<i32>,

    pub protocol: String,

    pub custom_domain: Option<String>,

    pub is_active: bool,

    pub connected_at: Option<ChronoDateTimeUtc>,

    pub last_connected: Option<ChronoDateTimeUtc>,

    pub last_disconnected: Option<ChronoDateTimeUtc>,

    pub total_requests: i64,

    pub total_bandwidth: i64,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    User,

    #[sea_orm(has_many = "super::live_stats::Entity")]
    LiveStats,

    #[sea_orm(has_many = "super::hourly_stats::Entity")]
    HourlyStats,

    #[sea_orm(has_many = "super::daily_stats::Entity")]
    DailyStats,

    #[sea_orm(has_many = "super::request_log::Entity")]
    RequestLog,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<&Model> for crate::protocol::TunnelSummary {
    fn from(model: &Model) -> Self {
        Self {
            id: model.id.clone(),
            subdomain: model.subdomain.clone(),
            name: model.name.clone(),
            description: model.description.clone(),
            local_port: model.local_port,
            protocol: model.protocol.clone(),
            is_active: model.is_active,
            connected_at: model.connected_at,
        }
    }
}
