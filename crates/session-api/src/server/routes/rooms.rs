#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    room_id: String,
    kind: String,
    #[serde(default)]
    initial_state: Value,
    #[serde(default)]
    players: Option<PlayerRoster>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn create_room(
    State(state): State<AppState>,
    Json(request): Json<CreateRoomRequest>,
) -> Result<Json<RoomRecord>, HttpApiError> {
    if request.room_id.trim().is_empty() {
        return Err(HttpApiError::bad_request(
            ErrorCode::InvalidActionShape,
            "roomId must not be empty",
        ));
    }
    let room = state
        .service
        .create_room(
            &request.room_id,
            &request.kind,
            request.initial_state,
            request.players,
            request.metadata,
        )
        .await
        .map_err(HttpApiError::from_api_error)?;
    Ok(Json(room))
}

#[derive(Debug, Deserialize)]
struct ListRoomsQuery {
    kind: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListRoomsResponse {
    schema_version: String,
    rooms: Vec<RoomRecord>,
}

async fn list_rooms(
    State(state): State<AppState>,
    Query(query): Query<ListRoomsQuery>,
) -> Result<Json<ListRoomsResponse>, HttpApiError> {
    let rooms = state
        .service
        .list_rooms(query.kind.as_deref())
        .await
        .map_err(HttpApiError::from_api_error)?;
    Ok(Json(ListRoomsResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        rooms,
    }))
}

async fn get_room(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<RoomRecord>, HttpApiError> {
    let room = state
        .service
        .get_room(&room_id)
        .await
        .map_err(HttpApiError::from_api_error)?
        .ok_or_else(|| HttpApiError::room_not_found(&room_id))?;
    Ok(Json(room))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConvertRequest {
    source_document: String,
}

async fn request_conversion(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
    body: String,
) -> Result<Json<RoomRecord>, HttpApiError> {
    if body.len() > MAX_CONVERT_BODY_BYTES {
        return Err(HttpApiError::bad_request(
            ErrorCode::PayloadTooLarge,
            "source document exceeds the size limit",
        ));
    }
    let request: ConvertRequest = serde_json::from_str(&body).map_err(|err| {
        HttpApiError::bad_request(
            ErrorCode::InvalidActionShape,
            format!("malformed convert request: {err}"),
        )
    })?;
    let room = state
        .service
        .request_conversion(&room_id, &request.source_document)
        .await
        .map_err(HttpApiError::from_api_error)?;
    Ok(Json(room))
}

async fn get_conversion_status(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ConversionReport>, HttpApiError> {
    let report = state
        .service
        .conversion_status(&room_id)
        .await
        .map_err(HttpApiError::from_api_error)?
        .ok_or_else(|| HttpApiError::room_not_found(&room_id))?;
    Ok(Json(report))
}

async fn get_snapshot(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<StreamMessage>, HttpApiError> {
    let snapshot = state
        .service
        .snapshot(&room_id)
        .await
        .map_err(HttpApiError::from_api_error)?;
    Ok(Json(snapshot))
}

async fn get_artifact(
    Path(reference): Path<String>,
    State(state): State<AppState>,
) -> Result<String, HttpApiError> {
    let content = state
        .service
        .runtime()
        .store()
        .fetch_artifact(&reference)
        .await
        .map_err(|err| {
            HttpApiError::from_api_error(ApiError::new(
                ErrorCode::StoreFailure,
                "artifact fetch failed",
                Some(err.to_string()),
            ))
        })?
        .ok_or_else(|| HttpApiError::room_not_found(&reference))?;
    Ok(content)
}
