use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};

use crate::{
    mirror::{BookMirror, MirrorMetricsSummary, SubscriptionDiff},
    models::{AssetSubscription, BookState, ConnectionStatus},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub mirror: Arc<BookMirror>,
}

/// Create the API router
pub fn create_router(mirror: Arc<BookMirror>) -> Router {
    let state = AppState { mirror };

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(get_metrics))
        .route("/books", get(get_books))
        .route("/books/:asset_id", get(get_book))
        .route("/assets", put(put_assets))
        .with_state(state)
}

// ===== Route Handlers =====

async fn get_metrics(State(state): State<AppState>) -> Json<MirrorMetricsSummary> {
    Json(state.mirror.metrics_summary())
}

/// Every mirrored asset from one store snapshot
async fn get_books(State(state): State<AppState>) -> Json<BooksResponse> {
    let snap = state.mirror.store().snapshot();

    let mut books = BTreeMap::new();
    for (asset_id, status) in &snap.status {
        books.insert(
            asset_id.clone(),
            BookEntry {
                status: Some(*status),
                book: snap.books.get(asset_id).map(|b| BookState::clone(b)),
            },
        );
    }
    for (asset_id, book) in &snap.books {
        books.entry(asset_id.clone()).or_insert_with(|| BookEntry {
            status: None,
            book: Some(BookState::clone(book)),
        });
    }

    Json(BooksResponse {
        frame: snap.frame,
        books,
    })
}

async fn get_book(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> Result<Json<AssetBookResponse>, ApiError> {
    let snap = state.mirror.store().snapshot();
    let status = snap.status(&asset_id);
    let book = snap.book(&asset_id).map(|b| BookState::clone(b));

    if status.is_none() && book.is_none() {
        return Err(ApiError::NotFound(format!("Asset {} is not mirrored", asset_id)));
    }

    Ok(Json(AssetBookResponse {
        asset_id,
        status,
        book,
    }))
}

/// Replace the desired asset set
async fn put_assets(
    State(state): State<AppState>,
    Json(assets): Json<Vec<AssetSubscription>>,
) -> Json<SubscriptionDiff> {
    Json(state.mirror.set_desired(assets).await)
}

// ===== Response Types =====

#[derive(Serialize)]
struct BookEntry {
    status: Option<ConnectionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    book: Option<BookState>,
}

#[derive(Serialize)]
struct BooksResponse {
    frame: u32,
    books: BTreeMap<String, BookEntry>,
}

#[derive(Serialize)]
struct AssetBookResponse {
    asset_id: String,
    status: Option<ConnectionStatus>,
    book: Option<BookState>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::MirrorConfig, models::OrderLevel};
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn mirror() -> Arc<BookMirror> {
        Arc::new(BookMirror::new(MirrorConfig {
            ws_url: "ws://127.0.0.1:9/ws".to_string(),
            ..MirrorConfig::default()
        }))
    }

    fn book() -> BookState {
        BookState {
            ready: true,
            msg_count: 7,
            bids: vec![OrderLevel {
                price: 0.41,
                size: 5.0,
                cumulative: 5.0,
            }],
            asks: vec![],
            tick_size: 0.01,
            last_trade: None,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(mirror());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_book_lookup() {
        let mirror = mirror();
        mirror.store().set_books_bulk(
            HashMap::from([("A".to_string(), book())]),
            Some(ConnectionStatus::Live),
        );
        mirror.store().bump_frame();
        let app = create_router(mirror);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/books/A").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["asset_id"], "A");
        assert_eq!(json["status"], "live");
        assert_eq!(json["book"]["msg_count"], 7);
        assert_eq!(json["book"]["bids"][0]["cumulative"], 5.0);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/books").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["frame"], 1);
        assert_eq!(json["books"]["A"]["status"], "live");

        let response = app
            .oneshot(Request::builder().uri("/books/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_assets_returns_diff() {
        let mirror = mirror();
        let app = create_router(mirror.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/assets")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"["A", {"asset_id": "B", "outcome": "Yes"}]"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["added"].as_array().unwrap().len(), 2);
        assert_eq!(json["added"][1]["outcome"], "Yes");
        assert_eq!(mirror.active().len(), 2);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["active_assets"], 2);

        mirror.shutdown().await;
    }
}
