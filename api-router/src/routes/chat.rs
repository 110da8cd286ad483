use std::{convert::Infallible, time::Duration};

use axum::{
    extract::State,
    http::HeaderValue,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use chat_pipeline::{prepare_turn, StreamItem, TurnRequest};
use common::storage::types::user::User;
use futures::StreamExt;

use crate::{
    api_state::ApiState,
    error::{quota_headers, ApiError},
};

/// One chat turn. Pre-stream failures come back as plain JSON errors; once
/// the reply starts it is an SSE stream of text fragments, closed by a
/// `done` event or an inline `error` event.
pub async fn chat_turn(
    State(state): State<ApiState>,
    user: Option<Extension<User>>,
    Json(request): Json<TurnRequest>,
) -> Response {
    let user = user.map(|Extension(user)| user);

    let prepared = match prepare_turn(&state.turn, user.as_ref(), request).await {
        Ok(prepared) => prepared,
        Err(error) => {
            return ApiError::from_turn(error, state.config.expose_error_details).into_response()
        }
    };

    let quota = prepared.quota;
    let conversation_id = prepared.conversation_id;
    let events = prepared.stream.map(|item| -> Result<Event, Infallible> {
        Ok(match item {
            StreamItem::Fragment(text) => Event::default().data(text),
            StreamItem::ErrorMarker(message) => Event::default().event("error").data(message),
            StreamItem::Done => Event::default().event("done").data("done"),
        })
    });

    let mut response = Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response();

    quota_headers(response.headers_mut(), &quota);
    if let Ok(value) = HeaderValue::from_str(&conversation_id) {
        response.headers_mut().insert("x-conversation-id", value);
    }
    response
}
