//! Request log entity: one row per completed public request.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub tunnel_id: String,

    pub path: String,

    pub method: String,

    pub status_code: i32,

    /// Milliseconds from ingress to response write.
    pub response_time: i32,

    pub request_size: i64,

    pub response_size: i64,

    pub client_ip: String,

    pub country: Option<String>,

    /// Truncated to 500 bytes.
    #[sea_orm(column_type = "Text", nullable)]
    pub user_agent: Option<String>,

    pub timestamp: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tunnel::Entity",
        from = "Column::TunnelId",
        to = "super::tunnel::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Tunnel,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
