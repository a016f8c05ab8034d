//! Device auth code entity: short-lived out-of-band activation codes.
//!
//! `user_id` and `token` are populated when the browser-side flow binds
//! a user; `claimed` flips at the same time. `is_used` flips once the
//! agent has collected the token.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device_auth_codes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub code: String,

    pub user_id: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub token: Option<String>,

    pub expires_at: ChronoDateTimeUtc,

    pub is_used: bool,

    pub claimed: bool,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id",
        on_update = "Cascade",
        on_delete = "SetNull"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
