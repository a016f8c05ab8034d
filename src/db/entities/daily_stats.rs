//! Daily stats entity, unique on `(tunnel_id, date)`, rolled up from the
//! day's hourly rows.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "daily_stats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub tunnel_id: String,

    pub date: ChronoDate,

    pub total_requests: i32,

    pub success_requests: i32,

    pub error_requests: i32,

    pub avg_response_time: f64,

    pub total_bandwidth: i64,

    pub unique_visitors: i32,

    /// Hour index in `[0, 23]` with the greatest `total_requests`.
    pub peak_hour: i32,
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
