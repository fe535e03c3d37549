#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "server io error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug)]
struct HttpApiError {
    status: StatusCode,
    error: ApiError,
}

impl HttpApiError {
    fn from_api_error(error: ApiError) -> Self {
        Self {
            status: status_for(error.error_code),
            error,
        }
    }

    fn room_not_found(room_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(
                ErrorCode::RoomNotFound,
                "room does not exist",
                Some(format!("room_id={room_id}")),
            ),
        }
    }

    fn bad_request(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: status_for(code),
            error: ApiError::new(code, message, None),
        }
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidActionShape | ErrorCode::InvalidKind => StatusCode::BAD_REQUEST,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::RoomNotFound => StatusCode::NOT_FOUND,
        ErrorCode::RoomNotReady | ErrorCode::RoomTerminated => StatusCode::CONFLICT,
        ErrorCode::StoreFailure
        | ErrorCode::ValidatorUnavailable
        | ErrorCode::ValidatorTimeout
        | ErrorCode::ValidatorLimit
        | ErrorCode::TimeoutRetry => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::AnalysisFailed
        | ErrorCode::LlmFailed
        | ErrorCode::ArtifactPublishFailed
        | ErrorCode::ValidatorDeployFailed => StatusCode::INTERNAL_SERVER_ERROR,
        // Benign validation outcomes travel in the response envelope, not
        // as HTTP errors.
        _ => StatusCode::OK,
    }
}
