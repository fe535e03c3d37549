#[derive(Clone)]
struct AppState {
    service: Arc<RoomService>,
}

fn asserted_player(headers: &HeaderMap) -> Result<String, HttpApiError> {
    let raw = headers
        .get(PLAYER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        return Err(HttpApiError::bad_request(
            ErrorCode::InvalidActionShape,
            format!("missing {PLAYER_HEADER} header"),
        ));
    }
    Ok(raw.to_string())
}
