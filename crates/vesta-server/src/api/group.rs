//! Config group handlers
//!
//! - POST /config/v1/groups - Create or update a group
//! - GET  /config/v1/groups - Groups of a namespace with their release revision

use actix_web::{Responder, get, post, web};

use vesta_persistence::ConfigFileGroup;

use super::model::NamespaceParam;
use super::respond;
use crate::model::app_state::AppState;

#[post("/groups")]
pub async fn create_config_file_group(
    data: web::Data<AppState>,
    body: web::Json<ConfigFileGroup>,
) -> impl Responder {
    respond(
        "create_group",
        data.center.create_config_file_group(body.into_inner()).await,
    )
}

#[get("/groups")]
pub async fn get_config_file_groups(
    data: web::Data<AppState>,
    params: web::Query<NamespaceParam>,
) -> impl Responder {
    respond(
        "list_groups",
        data.center.get_config_file_groups(&params.namespace),
    )
}
