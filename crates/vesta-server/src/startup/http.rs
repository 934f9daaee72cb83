//! HTTP server setup

use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware::Logger, web};

use crate::api;
use crate::model::app_state::AppState;

/// Creates and binds the main HTTP server
pub fn main_server(
    app_state: Arc<AppState>,
    address: String,
    port: u16,
    shutdown_timeout_secs: u64,
) -> Result<Server, std::io::Error> {
    Ok(HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::from(app_state.clone()))
            .configure(api::route::routes)
    })
    .shutdown_timeout(shutdown_timeout_secs)
    .bind((address, port))?
    .run())
}
