//! Hourly stats entity, unique on `(tunnel_id, hour)`.
//!
//! The three top-k mappings are stored as JSON text: arrays of
//! `[label, count]` pairs sorted descending by count, at most 10 entries.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "hourly_stats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub tunnel_id: String,

    /// Truncated to the hour, UTC.
    pub hour: ChronoDateTimeUtc,

    pub total_requests: i32,

    pub success_requests: i32,

    pub error_requests: i32,

    pub avg_response_time: f64,

    pub total_bandwidth: i64,

    pub unique_visitors: i32,

    #[sea_orm(column_type = "Text")]
    pub top_paths: String,

    #[sea_orm(column_type = "Text")]
    pub top_countries: String,

    #[sea_orm(column_type = "Text")]
    pub status_codes: String,
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
