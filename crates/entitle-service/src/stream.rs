//! Ledger change notifications as Server-Sent Events.

use crate::{ApiError, ServiceState};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStreamQuery {
    pub buyer_id: String,
}

/// One `ledger` event per row inserted or settled for the buyer.
pub async fn ledger_stream(
    State(state): State<ServiceState>,
    Query(query): Query<LedgerStreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let buyer_id = query.buyer_id.trim().to_string();
    if buyer_id.is_empty() {
        return Err(ApiError::Http {
            status: axum::http::StatusCode::BAD_REQUEST,
            message: "buyerId is required".to_string(),
        });
    }

    debug!(buyer_id = %buyer_id, "ledger stream opened");
    let subscription = state.engine.subscribe(buyer_id);

    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.next().await?;
        let json = serde_json::to_string(&event).unwrap_or_default();
        Some((Ok(Event::default().event("ledger").data(json)), subscription))
    });

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

#[cfg(test)]
mod tests {
    use crate::build_router;
    use crate::tests::harness;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn manual_purchase_is_pushed_to_buyer_stream() {
        let h = harness();
        let response = build_router(h.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/v1/ledger/stream?buyerId=u7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Another buyer's row must not appear on this stream.
        h.state
            .engine
            .record_manual_purchase("someone-else", "m1", None)
            .await
            .unwrap();
        h.state
            .engine
            .record_manual_purchase("u7", "m1", Some("AR"))
            .await
            .unwrap();

        let mut body = response.into_body().into_data_stream();
        let frame = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains("event: ledger"));
        assert!(text.contains("\"type\":\"inserted\""));
        assert!(text.contains("\"buyer_id\":\"u7\""));
    }

    #[tokio::test]
    async fn stream_requires_buyer() {
        let h = harness();
        let response = build_router(h.state)
            .oneshot(
                Request::builder()
                    .uri("/v1/ledger/stream?buyerId=")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
