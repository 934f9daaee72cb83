//! HTTP surface of the release engine, mounted under `/config/v1`

pub mod client;
pub mod group;
pub mod model;
pub mod release;
pub mod route;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, HttpResponseBuilder};
use metrics::counter;
use serde::Serialize;

use vesta_common::error::{
    DATA_CONFLICT, DATA_NO_CHANGE, INVALID_MATCH_RULE, INVALID_PARAMETER, NOT_FOUND_RESOURCE,
    SUCCESS,
};
use vesta_config::model::{ApiResponse, BatchWriteResponse};

use crate::metrics::HTTP_REQUESTS_TOTAL;

/// HTTP status carrying an engine response code
pub fn http_status(code: i32) -> StatusCode {
    match code {
        c if c == SUCCESS.code || c == DATA_NO_CHANGE.code => StatusCode::OK,
        c if c == INVALID_PARAMETER.code || c == INVALID_MATCH_RULE.code => StatusCode::BAD_REQUEST,
        c if c == NOT_FOUND_RESOURCE.code => StatusCode::NOT_FOUND,
        c if c == DATA_CONFLICT.code => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn respond<T: Serialize>(endpoint: &'static str, response: ApiResponse<T>) -> HttpResponse {
    record(endpoint, response.code);
    HttpResponseBuilder::new(http_status(response.code)).json(response)
}

/// Batch writes answer 200 with per-item codes unless every item failed alike
pub fn respond_batch(endpoint: &'static str, response: BatchWriteResponse) -> HttpResponse {
    record(endpoint, response.code);
    let status = if response.responses.iter().any(|r| r.is_success()) {
        StatusCode::OK
    } else {
        http_status(response.code)
    };
    HttpResponseBuilder::new(status).json(response)
}

fn record(endpoint: &'static str, code: i32) {
    counter!(HTTP_REQUESTS_TOTAL, "endpoint" => endpoint, "code" => code.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use vesta_common::error::PERSISTENCE_EXCEPTION;

    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status(SUCCESS.code), StatusCode::OK);
        assert_eq!(http_status(DATA_NO_CHANGE.code), StatusCode::OK);
        assert_eq!(http_status(INVALID_MATCH_RULE.code), StatusCode::BAD_REQUEST);
        assert_eq!(http_status(NOT_FOUND_RESOURCE.code), StatusCode::NOT_FOUND);
        assert_eq!(http_status(DATA_CONFLICT.code), StatusCode::CONFLICT);
        assert_eq!(
            http_status(PERSISTENCE_EXCEPTION.code),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
