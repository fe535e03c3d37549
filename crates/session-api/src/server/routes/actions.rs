/// Action submission. The body follows the submission envelope
/// `{roomId, action}`; a bare action object is also accepted. The player
/// identity comes from the authenticated transport header, never the
/// payload.
async fn submit_action(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, HttpApiError> {
    let limits = state.service.runtime().limits();
    if body.len() > limits.max_payload_bytes {
        return Err(HttpApiError::bad_request(
            ErrorCode::PayloadTooLarge,
            format!("payload exceeds {} bytes", limits.max_payload_bytes),
        ));
    }

    let player_id = asserted_player(&headers)?;
    let action = parse_action_body(&room_id, &body)?;

    let response = state.service.submit(&room_id, action, &player_id).await;
    let status = match &response.error {
        Some(error) if !error.error_code.is_validation() => status_for(error.error_code),
        _ => StatusCode::OK,
    };
    Ok((status, Json(response)).into_response())
}

fn parse_action_body(room_id: &str, body: &str) -> Result<Action, HttpApiError> {
    if let Ok(request) = serde_json::from_str::<SubmitRequest>(body) {
        if request.room_id != room_id {
            return Err(HttpApiError::bad_request(
                ErrorCode::InvalidActionShape,
                format!(
                    "body roomId {} does not match path room {}",
                    request.room_id, room_id
                ),
            ));
        }
        return Ok(request.action);
    }
    serde_json::from_str::<Action>(body).map_err(|err| {
        HttpApiError::bad_request(
            ErrorCode::InvalidActionShape,
            format!("malformed action: {err}"),
        )
    })
}
