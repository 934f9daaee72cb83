//! Route configuration

use actix_web::{HttpResponse, Responder, get, web};

use super::{client, group, release};
use crate::model::app_state::AppState;

/// Mount the `/config/v1` scope and the metrics endpoint
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/config/v1")
            .service(release::publish_config_file)
            .service(release::upsert_and_release_config_file)
            .service(release::rollback_config_file_releases)
            .service(release::stop_gray_config_file_releases)
            .service(release::delete_config_file_releases)
            .service(release::get_config_file_releases)
            .service(release::get_config_file_release_versions)
            .service(release::get_config_file_release_histories)
            .service(release::create_config_file)
            .service(group::create_config_file_group)
            .service(group::get_config_file_groups)
            .service(client::get_config_file_with_cache)
            .service(client::long_pull_watch_file)
            .service(client::get_config_subscribers)
            .service(client::get_client_subscribers),
    )
    .service(metrics);
}

#[get("/metrics")]
async fn metrics(data: web::Data<AppState>) -> impl Responder {
    match &data.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
