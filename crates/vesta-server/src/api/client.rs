//! Client-facing handlers: cached reads, long-poll watch and watch introspection
//!
//! - POST /config/v1/client/file         - Read the release visible to the client
//! - POST /config/v1/client/watch        - Long-poll for changes
//! - GET  /config/v1/subscribers/file    - Watchers of a file
//! - GET  /config/v1/subscribers/client  - Files a client waits on

use actix_web::{Responder, get, post, web};

use vesta_config::model::{ClientConfigFileRequest, WatchConfigFileRequest};

use super::model::{ClientParam, FileParam};
use super::respond;
use crate::model::app_state::AppState;

#[post("/client/file")]
pub async fn get_config_file_with_cache(
    data: web::Data<AppState>,
    body: web::Json<ClientConfigFileRequest>,
) -> impl Responder {
    respond("client_file", data.center.get_config_file_with_cache(&body))
}

/// The registration is cancelled if the client disconnects before it completes
#[post("/client/watch")]
pub async fn long_pull_watch_file(
    data: web::Data<AppState>,
    body: web::Json<WatchConfigFileRequest>,
) -> impl Responder {
    respond("client_watch", data.center.long_pull_watch_file(&body).await)
}

#[get("/subscribers/file")]
pub async fn get_config_subscribers(
    data: web::Data<AppState>,
    params: web::Query<FileParam>,
) -> impl Responder {
    respond(
        "file_subscribers",
        data.center.get_config_subscribers(&params.file()),
    )
}

#[get("/subscribers/client")]
pub async fn get_client_subscribers(
    data: web::Data<AppState>,
    params: web::Query<ClientParam>,
) -> impl Responder {
    respond(
        "client_subscribers",
        data.center.get_client_subscribers(&params.client_id),
    )
}
