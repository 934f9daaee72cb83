//! Release lifecycle and release query handlers
//!
//! - POST   /config/v1/releases          - Publish a config file
//! - POST   /config/v1/releases/upsert   - Save and publish in one step (md5 guarded)
//! - PUT    /config/v1/releases/rollback - Roll back releases (batch)
//! - POST   /config/v1/releases/stopgray - Stop gray releases (batch)
//! - DELETE /config/v1/releases          - Delete releases (batch)
//! - GET    /config/v1/releases          - List releases
//! - GET    /config/v1/releases/versions - Release versions of a file
//! - GET    /config/v1/releases/history  - Release history of a file
//! - POST   /config/v1/files             - Save a config file without publishing

use actix_web::{Responder, delete, get, post, put, web};

use vesta_config::model::{
    ConfigFilePublishInfo, ConfigFileReleaseRequest, HistoryQuery, ReleaseQuery,
};
use vesta_persistence::{ConfigFile, ConfigFileKey, ConfigFileReleaseKey};

use super::model::FileParam;
use super::{respond, respond_batch};
use crate::model::app_state::AppState;

#[post("/releases")]
pub async fn publish_config_file(
    data: web::Data<AppState>,
    body: web::Json<ConfigFileReleaseRequest>,
) -> impl Responder {
    respond("publish", data.center.publish_config_file(&body).await)
}

#[post("/releases/upsert")]
pub async fn upsert_and_release_config_file(
    data: web::Data<AppState>,
    body: web::Json<ConfigFilePublishInfo>,
) -> impl Responder {
    respond(
        "upsert_and_release",
        data.center.upsert_and_release_config_file(&body).await,
    )
}

#[put("/releases/rollback")]
pub async fn rollback_config_file_releases(
    data: web::Data<AppState>,
    body: web::Json<Vec<ConfigFileReleaseKey>>,
) -> impl Responder {
    respond_batch(
        "rollback",
        data.center
            .rollback_config_file_releases(body.into_inner())
            .await,
    )
}

#[post("/releases/stopgray")]
pub async fn stop_gray_config_file_releases(
    data: web::Data<AppState>,
    body: web::Json<Vec<ConfigFileKey>>,
) -> impl Responder {
    respond_batch(
        "stop_gray",
        data.center
            .stop_gray_config_file_releases(body.into_inner())
            .await,
    )
}

#[delete("/releases")]
pub async fn delete_config_file_releases(
    data: web::Data<AppState>,
    body: web::Json<Vec<ConfigFileReleaseKey>>,
) -> impl Responder {
    respond_batch(
        "delete",
        data.center
            .delete_config_file_releases(body.into_inner())
            .await,
    )
}

#[get("/releases")]
pub async fn get_config_file_releases(
    data: web::Data<AppState>,
    params: web::Query<ReleaseQuery>,
) -> impl Responder {
    respond(
        "list_releases",
        data.center.get_config_file_releases(&params).await,
    )
}

#[get("/releases/versions")]
pub async fn get_config_file_release_versions(
    data: web::Data<AppState>,
    params: web::Query<FileParam>,
) -> impl Responder {
    respond(
        "release_versions",
        data.center
            .get_config_file_release_versions(&params.file())
            .await,
    )
}

#[get("/releases/history")]
pub async fn get_config_file_release_histories(
    data: web::Data<AppState>,
    params: web::Query<HistoryQuery>,
) -> impl Responder {
    respond(
        "release_history",
        data.center.get_config_file_release_histories(&params).await,
    )
}

#[post("/files")]
pub async fn create_config_file(
    data: web::Data<AppState>,
    body: web::Json<ConfigFile>,
) -> impl Responder {
    respond(
        "create_file",
        data.center.create_config_file(body.into_inner()).await,
    )
}
