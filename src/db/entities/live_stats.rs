//! Live stats entity: one row per tunnel, mutated eagerly on every
//! completed request.
//!
//! `avg_response_time` is last-wins and `error_rate` is an accumulator,
//! matching what the dashboards already consume.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "live_stats")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub tunnel_id: String,

    #[sea_orm(column_name = "requests_last_5_min")]
    pub requests_last_5_min: i32,

    #[sea_orm(column_name = "requests_last_1_hour")]
    pub requests_last_1_hour: i32,

    pub avg_response_time: f64,

    pub error_rate: i32,

    pub last_updated: ChronoDateTimeUtc,
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
